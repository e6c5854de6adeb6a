mod jobs;
mod server;
mod tooling;

pub use jobs::{CancelOutcome, JobRecord, JobService, JobStatus, JobStore, SubmitError};
pub use tooling::{load_settings, load_settings_from_path, FailureKind, ServiceSettings};

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .filter_module("hyper", log::LevelFilter::Warn)
        .filter_module("tower", log::LevelFilter::Warn)
        .filter_module("mio", log::LevelFilter::Warn)
        .parse_env("RUST_LOG")
        .init();
}

pub fn run() {
    init_logging();

    let settings = match load_settings() {
        Ok(settings) => settings,
        Err(error) => {
            log::error!("{error}");
            std::process::exit(2);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("error while starting the async runtime");
    if let Err(error) = runtime.block_on(server::serve(settings)) {
        log::error!("{error}");
        std::process::exit(1);
    }
}
