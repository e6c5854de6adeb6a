use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ffi::OsStr;
use std::fs;
use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use url::Url;
use which::which;

mod extract_audio;
mod failure;
mod media_io;
mod progress;
mod runtime;

pub(crate) use extract_audio::*;
pub use failure::*;
pub(crate) use media_io::*;
pub(crate) use progress::*;
pub use runtime::*;
