// Bounded worker pool that accepts submissions and owns the job store.
use super::*;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("{0}")]
    InputInvalid(String),
    #[error("{0}")]
    ExternalToolMissing(String),
    #[error("Too many downloads are queued. Try again in a moment.")]
    QueueFull,
    #[error("The download service is shutting down.")]
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Requested,
    AlreadyFinished,
    NotFound,
}

#[derive(Clone)]
pub struct JobService {
    inner: Arc<JobServiceInner>,
}

pub(crate) struct JobServiceInner {
    pub(crate) store: Arc<JobStore>,
    pub(crate) settings: Arc<ServiceSettings>,
    pub(crate) output_dir: PathBuf,
    queue: SyncSender<JobTicket>,
    cancellations: Arc<Mutex<HashMap<String, CancelToken>>>,
}

impl JobService {
    pub fn start(settings: ServiceSettings) -> Result<Self, String> {
        let output_dir = ensure_output_dir(&settings)?;
        let settings = Arc::new(settings);
        let store = Arc::new(JobStore::new());
        let cancellations: Arc<Mutex<HashMap<String, CancelToken>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (queue, receiver) = mpsc::sync_channel::<JobTicket>(settings.queue_capacity());
        let receiver = Arc::new(Mutex::new(receiver));

        for index in 0..settings.worker_count() {
            let worker = Worker {
                receiver: Arc::clone(&receiver),
                store: Arc::clone(&store),
                settings: Arc::clone(&settings),
                output_dir: output_dir.clone(),
                cancellations: Arc::clone(&cancellations),
            };
            thread::Builder::new()
                .name(format!("audio-fetch-worker-{index}"))
                .spawn(move || worker.run())
                .map_err(|error| format!("Failed to start download worker: {error}"))?;
        }

        let inner = Arc::new(JobServiceInner {
            store,
            settings: Arc::clone(&settings),
            output_dir,
            queue,
            cancellations,
        });
        spawn_sweeper(Arc::downgrade(&inner), settings.sweep_interval())?;
        log::info!(
            "Download service ready: {} workers, queue capacity {}, output {}",
            settings.worker_count(),
            settings.queue_capacity(),
            inner.output_dir.display()
        );
        Ok(Self { inner })
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.inner.settings
    }

    pub fn output_dir(&self) -> &Path {
        &self.inner.output_dir
    }

    pub fn status(&self, id: &str) -> Option<JobRecord> {
        self.inner.store.get(id)
    }

    pub fn tools_status(&self) -> RuntimeToolsStatus {
        build_runtime_status(&self.inner.settings)
    }

    pub fn submit(&self, raw_url: Option<&str>) -> Result<String, SubmitError> {
        let raw_url = raw_url
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| SubmitError::InputInvalid("URL is required.".to_string()))?;
        let url = validate_media_url(raw_url, &self.inner.settings.allowed_hosts)
            .map_err(SubmitError::InputInvalid)?;
        let tools = resolve_tools(&self.inner.settings).map_err(SubmitError::ExternalToolMissing)?;

        let job_id = uuid::Uuid::new_v4().to_string();
        self.inner.store.create(&job_id);
        let cancel = CancelToken::new();
        self.inner
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.clone(), cancel.clone());

        let ticket = JobTicket {
            id: job_id.clone(),
            url: url.to_string(),
            tools,
            cancel,
        };
        match self.inner.queue.try_send(ticket) {
            Ok(()) => {
                log::info!("Job {job_id}: queued {url}");
                Ok(job_id)
            }
            Err(error) => {
                self.inner.store.remove(&job_id);
                self.inner
                    .cancellations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&job_id);
                match error {
                    TrySendError::Full(_) => {
                        log::warn!("Rejecting submission: download queue is full");
                        Err(SubmitError::QueueFull)
                    }
                    TrySendError::Disconnected(_) => Err(SubmitError::Unavailable),
                }
            }
        }
    }

    pub fn cancel(&self, id: &str) -> CancelOutcome {
        let Some(record) = self.inner.store.get(id) else {
            return CancelOutcome::NotFound;
        };
        if record.is_terminal() {
            return CancelOutcome::AlreadyFinished;
        }
        let token = self
            .inner
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        match token {
            Some(token) => {
                log::info!("Job {id}: cancellation requested");
                token.cancel();
                CancelOutcome::Requested
            }
            None => CancelOutcome::AlreadyFinished,
        }
    }
}

struct Worker {
    receiver: Arc<Mutex<Receiver<JobTicket>>>,
    store: Arc<JobStore>,
    settings: Arc<ServiceSettings>,
    output_dir: PathBuf,
    cancellations: Arc<Mutex<HashMap<String, CancelToken>>>,
}

impl Worker {
    fn next_ticket(&self) -> Option<JobTicket> {
        let receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        receiver.recv().ok()
    }

    fn run(self) {
        while let Some(ticket) = self.next_ticket() {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                run_job(&self.store, &ticket, &self.settings, &self.output_dir)
            }));
            if outcome.is_err() {
                log::error!("Job {}: runner panicked", ticket.id);
                self.store.update(&ticket.id, |record| {
                    record.fail(&DownloadFailure::generic("internal error while processing the download"))
                });
            }
            self.cancellations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&ticket.id);
        }
        log::debug!("Download worker exiting: queue closed");
    }
}
