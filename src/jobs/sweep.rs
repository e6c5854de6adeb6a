// Periodic reclamation of finished jobs and their leftover files.
use super::*;
use std::sync::Weak;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct SweepReport {
    pub(crate) jobs: usize,
    pub(crate) files: usize,
}

fn file_modified_or_epoch(path: &Path) -> SystemTime {
    path.metadata()
        .ok()
        .and_then(|metadata| metadata.modified().ok())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

pub(crate) fn sweep_expired(store: &JobStore, output_dir: &Path, retention: Duration) -> SweepReport {
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut report = SweepReport::default();

    for (id, record) in store.remove_finished_before(cutoff) {
        report.jobs += 1;
        let Some(filename) = record.filename.filter(|name| is_safe_file_name(name)) else {
            continue;
        };
        let path = output_dir.join(&filename);
        if path.is_file() {
            match fs::remove_file(&path) {
                Ok(()) => report.files += 1,
                Err(error) => log::warn!("Job {id}: failed to remove {filename}: {error}"),
            }
        }
    }

    if let Ok(entries) = fs::read_dir(output_dir) {
        for entry in entries.flatten() {
            let candidate = entry.path();
            let is_temp = candidate
                .file_name()
                .and_then(|value| value.to_str())
                .map(|name| name.starts_with("af-"))
                .unwrap_or(false);
            if !is_temp || !candidate.is_file() || file_modified_or_epoch(&candidate) >= cutoff {
                continue;
            }
            match fs::remove_file(&candidate) {
                Ok(()) => report.files += 1,
                Err(error) => log::warn!("Failed to remove {}: {error}", candidate.display()),
            }
        }
    }

    if report.jobs > 0 || report.files > 0 {
        log::info!(
            "Retention sweep removed {} jobs and {} files",
            report.jobs,
            report.files
        );
    }
    report
}

pub(crate) fn spawn_sweeper(service: Weak<JobServiceInner>, interval: Duration) -> Result<(), String> {
    thread::Builder::new()
        .name("audio-fetch-sweeper".to_string())
        .spawn(move || loop {
            thread::sleep(interval);
            let Some(inner) = service.upgrade() else {
                break;
            };
            sweep_expired(&inner.store, &inner.output_dir, inner.settings.retention());
        })
        .map(|_| ())
        .map_err(|error| format!("Failed to start retention sweeper: {error}"))
}
