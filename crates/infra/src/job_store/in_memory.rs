use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::Utc;

use reporter_core::{Job, JobId, JobStatus};

use super::r#trait::{check_transition, JobStats, JobStore, JobStoreError};

/// In-memory job store.
///
/// Intended for tests/dev. Not durable.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> JobStoreError {
    JobStoreError::Unavailable("job store lock poisoned".to_string())
}

impl JobStore for InMemoryJobStore {
    fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        jobs.get(&id).cloned().ok_or(JobStoreError::NotFound(id))
    }

    fn update_status(
        &self,
        id: JobId,
        expected: JobStatus,
        new: JobStatus,
    ) -> Result<(), JobStoreError> {
        check_transition(id, expected, new)?;

        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        if job.status != expected {
            return Err(JobStoreError::Conflict {
                id,
                expected,
                actual: job.status,
            });
        }

        job.transition(new, Utc::now())
            .map_err(|_| JobStoreError::InvalidTransition {
                id,
                from: expected,
                to: new,
            })
    }

    fn record_attempt(&self, id: JobId) -> Result<u32, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        Ok(job.record_attempt())
    }

    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs.values().cloned().collect();

        // Newest first; ids are time-ordered so they break ties the same way.
        result.sort_by(|a, b| {
            b.submitted_at
                .cmp(&a.submitted_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        result.truncate(limit);
        Ok(result)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.count(job.status, 1);
        }
        Ok(stats)
    }
}
