// Job status records shared by the store, the runner and the HTTP layer.
use super::*;

pub(crate) const STARTING_MESSAGE: &str = "Starting download...";
pub(crate) const FINALIZING_MESSAGE: &str = "Finalizing audio file...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Downloading,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub status: JobStatus,
    pub progress: f32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(skip)]
    pub finished_at: Option<SystemTime>,
}

impl JobRecord {
    pub fn starting() -> Self {
        Self {
            status: JobStatus::Starting,
            progress: 0.0,
            message: STARTING_MESSAGE.to_string(),
            filename: None,
            attempt: 0,
            error_kind: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn complete(&mut self, filename: String) {
        self.status = JobStatus::Completed;
        self.progress = 100.0;
        self.message = "Download complete.".to_string();
        self.filename = Some(filename);
        self.error_kind = None;
    }

    pub(crate) fn fail(&mut self, failure: &DownloadFailure) {
        self.status = JobStatus::Error;
        self.message = failure.to_string();
        self.filename = None;
        self.error_kind = Some(failure.kind());
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase_and_omits_empty_fields() {
        let record = JobRecord::starting();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "starting");
        assert_eq!(value["progress"], 0.0);
        assert_eq!(value["attempt"], 0);
        assert!(value.get("filename").is_none());
        assert!(value.get("errorKind").is_none());
        assert!(value.get("finishedAt").is_none());
    }

    #[test]
    fn completion_and_failure_shapes() {
        let mut done = JobRecord::starting();
        done.complete("Song.mp3".to_string());
        let value = serde_json::to_value(&done).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["progress"], 100.0);
        assert_eq!(value["filename"], "Song.mp3");

        let mut failed = JobRecord::starting();
        failed.fail(&DownloadFailure::RateLimited {
            detail: "HTTP Error 429".to_string(),
        });
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["errorKind"], "rateLimited");
        assert!(value["message"].as_str().unwrap().starts_with("Rate limited"));
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Downloading.is_terminal());
    }
}
