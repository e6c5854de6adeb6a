use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, SystemTime};

use crate::tooling::*;

mod core_types;
mod pool;
mod runner;
mod store;
mod sweep;

pub use core_types::*;
pub use pool::*;
pub(crate) use runner::*;
pub use store::*;
pub(crate) use sweep::*;
