// Drives one job end to end: attempts, backoff, status writes.
use super::*;
use rand::Rng;

#[derive(Debug, Clone)]
pub(crate) struct JobTicket {
    pub(crate) id: String,
    pub(crate) url: String,
    pub(crate) tools: ResolvedTools,
    pub(crate) cancel: CancelToken,
}

pub(crate) fn new_temp_stem() -> String {
    format!("af-{}", uuid::Uuid::new_v4().simple())
}

pub(crate) fn backoff_delay(settings: &ServiceSettings) -> Duration {
    let (min, max) = settings.backoff_bounds_ms();
    if min == max {
        return Duration::from_millis(min);
    }
    Duration::from_millis(rand::rng().random_range(min..=max))
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancelToken) -> bool {
    let mut remaining = delay;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return true;
        }
        let slice = remaining.min(CANCEL_POLL_INTERVAL);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
    cancel.is_cancelled()
}

pub(crate) fn apply_progress_event(store: &JobStore, job_id: &str, event: ProgressEvent) {
    match event {
        ProgressEvent::NoOp => {}
        ProgressEvent::Message(message) => {
            store.update(job_id, |record| {
                record.status = JobStatus::Downloading;
                record.message = message;
            });
        }
        ProgressEvent::Progress(percent) => {
            store.update(job_id, |record| {
                record.status = JobStatus::Downloading;
                record.progress = percent;
                record.message = format!("Downloading: {percent:.1}%");
            });
        }
        ProgressEvent::OutputPath(_) => {
            store.update(job_id, |record| {
                record.status = JobStatus::Downloading;
                record.message = FINALIZING_MESSAGE.to_string();
            });
        }
    }
}

pub(crate) fn run_job(
    store: &JobStore,
    ticket: &JobTicket,
    settings: &ServiceSettings,
    output_dir: &Path,
) {
    let job_id = ticket.id.as_str();
    let max_attempts = settings.max_attempts();
    let mut last_failure: Option<DownloadFailure> = None;

    for attempt in 1..=max_attempts {
        if ticket.cancel.is_cancelled() {
            last_failure = Some(DownloadFailure::Cancelled);
            break;
        }
        store.update(job_id, |record| {
            record.attempt = attempt;
            record.progress = 0.0;
            if attempt > 1 {
                record.message = format!("Retrying (attempt {attempt} of {max_attempts})...");
            }
        });

        let stem = new_temp_stem();
        log::info!("Job {job_id}: attempt {attempt}/{max_attempts} using stem {stem}");
        let request = ExtractionRequest {
            url: &ticket.url,
            stem: &stem,
            output_dir,
            tools: &ticket.tools,
            settings,
        };
        let cancel = ticket.cancel.clone();
        let outcome = run_extraction_attempt(&request, &move || cancel.is_cancelled(), &mut |event| {
            apply_progress_event(store, job_id, event)
        });

        let failure = match outcome {
            Ok(produced) => {
                store.update(job_id, |record| {
                    record.message = FINALIZING_MESSAGE.to_string();
                });
                let title = resolve_title(&ticket.tools, settings, &ticket.url);
                match publish_output(
                    output_dir,
                    &produced,
                    title.as_deref(),
                    &stem,
                    &settings.audio_format,
                ) {
                    Ok(filename) => {
                        log::info!("Job {job_id}: completed as {filename}");
                        store.update(job_id, |record| record.complete(filename));
                        return;
                    }
                    Err(error) => {
                        log::error!("Job {job_id}: {error}");
                        remove_stem_files(output_dir, &stem);
                        DownloadFailure::generic(error)
                    }
                }
            }
            Err(DownloadFailure::Cancelled) => {
                last_failure = Some(DownloadFailure::Cancelled);
                break;
            }
            Err(failure) => {
                log::warn!(
                    "Job {job_id}: attempt {attempt} failed ({:?}): {}",
                    failure.kind(),
                    failure.detail()
                );
                remove_stem_files(output_dir, &stem);
                failure
            }
        };
        last_failure = Some(failure);

        if attempt < max_attempts {
            let delay = backoff_delay(settings);
            store.update(job_id, |record| {
                record.message = format!(
                    "Attempt {attempt} failed, retrying in {:.1}s...",
                    delay.as_secs_f32()
                );
            });
            if sleep_unless_cancelled(delay, &ticket.cancel) {
                last_failure = Some(DownloadFailure::Cancelled);
                break;
            }
        }
    }

    let failure =
        last_failure.unwrap_or_else(|| DownloadFailure::generic("no download attempt was made"));
    log::warn!("Job {job_id}: giving up: {failure}");
    store.update(job_id, |record| record.fail(&failure));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_bounds() {
        let settings = ServiceSettings {
            backoff_min_ms: Some(20),
            backoff_max_ms: Some(40),
            ..ServiceSettings::default()
        };
        for _ in 0..50 {
            let delay = backoff_delay(&settings);
            assert!(delay >= Duration::from_millis(20) && delay <= Duration::from_millis(40));
        }
        let fixed = ServiceSettings {
            backoff_min_ms: Some(0),
            backoff_max_ms: Some(0),
            ..ServiceSettings::default()
        };
        assert_eq!(backoff_delay(&fixed), Duration::ZERO);
    }

    #[test]
    fn stems_are_unique_and_prefixed() {
        let first = new_temp_stem();
        let second = new_temp_stem();
        assert!(first.starts_with("af-"));
        assert_ne!(first, second);
    }

    #[test]
    fn progress_events_move_job_to_downloading() {
        let store = JobStore::new();
        store.create("j");
        apply_progress_event(&store, "j", ProgressEvent::NoOp);
        assert_eq!(store.get("j").unwrap().status, JobStatus::Starting);

        apply_progress_event(&store, "j", ProgressEvent::Message("Processing...".to_string()));
        let record = store.get("j").unwrap();
        assert_eq!(record.status, JobStatus::Downloading);
        assert_eq!(record.message, "Processing...");

        apply_progress_event(&store, "j", ProgressEvent::Progress(60.0));
        apply_progress_event(&store, "j", ProgressEvent::Progress(40.0));
        let record = store.get("j").unwrap();
        assert_eq!(record.progress, 40.0);
        assert_eq!(record.message, "Downloading: 40.0%");
    }

    #[test]
    fn cancelled_before_start_ends_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new();
        store.create("j");
        let ticket = JobTicket {
            id: "j".to_string(),
            url: "https://example.com/v".to_string(),
            tools: ResolvedTools {
                ytdlp: PathBuf::from("/nonexistent/yt-dlp"),
                ffmpeg: None,
            },
            cancel: CancelToken::new(),
        };
        ticket.cancel.cancel();
        run_job(&store, &ticket, &ServiceSettings::default(), dir.path());
        let record = store.get("j").unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert_eq!(record.error_kind, Some(FailureKind::Cancelled));
        assert_eq!(record.attempt, 0);
    }

    #[test]
    fn missing_binary_fails_after_all_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new();
        store.create("j");
        let ticket = JobTicket {
            id: "j".to_string(),
            url: "https://example.com/v".to_string(),
            tools: ResolvedTools {
                ytdlp: PathBuf::from("/nonexistent/yt-dlp"),
                ffmpeg: None,
            },
            cancel: CancelToken::new(),
        };
        let settings = ServiceSettings {
            max_attempts: Some(2),
            backoff_min_ms: Some(0),
            backoff_max_ms: Some(0),
            ..ServiceSettings::default()
        };
        run_job(&store, &ticket, &settings, dir.path());
        let record = store.get("j").unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert_eq!(record.attempt, 2);
        assert_eq!(record.error_kind, Some(FailureKind::GenericDownloadFailure));
        assert!(record.message.contains("Failed to start yt-dlp"));
    }
}
