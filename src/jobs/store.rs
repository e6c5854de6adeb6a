// Process-wide job status map with one lock per record.
use super::*;

#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<String, Arc<Mutex<JobRecord>>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &str) -> Option<Arc<Mutex<JobRecord>>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn create(&self, id: &str) -> bool {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(id) {
            return false;
        }
        jobs.insert(id.to_string(), Arc::new(Mutex::new(JobRecord::starting())));
        true
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        let entry = self.entry(id)?;
        let record = entry.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(record)
    }

    pub fn set(&self, id: &str, record: JobRecord) -> bool {
        self.update(id, move |current| *current = record)
    }

    pub fn update<F>(&self, id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut JobRecord),
    {
        let Some(entry) = self.entry(id) else {
            log::debug!("Ignoring update for unknown job {id}");
            return false;
        };
        let mut record = entry.lock().unwrap_or_else(PoisonError::into_inner);
        // terminal records are frozen
        if record.is_terminal() {
            log::debug!(
                "Ignoring update for job {id}: already {}",
                record.status.as_str()
            );
            return false;
        }
        apply(&mut record);
        if record.is_terminal() && record.finished_at.is_none() {
            record.finished_at = Some(SystemTime::now());
        }
        true
    }

    pub fn remove(&self, id: &str) -> Option<JobRecord> {
        let entry = self
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)?;
        let record = entry.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn remove_finished_before(&self, cutoff: SystemTime) -> Vec<(String, JobRecord)> {
        let mut removed = Vec::new();
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.retain(|id, entry| {
            let record = entry.lock().unwrap_or_else(PoisonError::into_inner);
            let expired = record
                .finished_at
                .map(|finished| finished < cutoff)
                .unwrap_or(false);
            if expired {
                removed.push((id.clone(), record.clone()));
            }
            !expired
        });
        removed
    }
}
