use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use reporter_core::{Job, JobId, JobStatus};

/// Job store operation error.
///
/// These are **infrastructure errors**. The coordinator classifies them into
/// caller-facing kinds; they are never passed through unmodified.
///
/// ## Error Categories
///
/// - **NotFound**: No record for the id
/// - **AlreadyExists**: Id collision on create (broken id generator)
/// - **Conflict**: Compare-and-swap observed a different status than expected
/// - **InvalidTransition**: The requested edge is not a forward lifecycle move
/// - **Unavailable**: Backend temporarily unreachable (safe to retry)
/// - **Storage**: Any other backend failure (not retried)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("status conflict for job {id}: expected {expected}, found {actual}")]
    Conflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("invalid status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job store unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Unavailable(_))
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.queued + self.in_progress + self.succeeded + self.failed
    }

    pub(crate) fn count(&mut self, status: JobStatus, n: usize) {
        match status {
            JobStatus::Queued => self.queued += n,
            JobStatus::InProgress => self.in_progress += n,
            JobStatus::Succeeded => self.succeeded += n,
            JobStatus::Failed => self.failed += n,
        }
    }
}

/// Durable keyed record of jobs with compare-and-swap status updates.
///
/// ## Consistency
///
/// - `get` immediately after a successful `create` must observe the record
/// - `update_status` is atomic per job id; concurrent callers racing on the
///   same predecessor status see exactly one success
/// - Isolation is per record: implementations must not serialize unrelated jobs
///   behind a store-wide lock held across IO
///
/// ## Blocking
///
/// All methods are blocking. Callers on an async runtime must issue them from
/// a blocking-capable thread (e.g. `spawn_blocking`).
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    fn create(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Load a job by id.
    fn get(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Atomically move `id` from `expected` to `new`.
    ///
    /// Implementations must:
    /// - reject edges that are not forward lifecycle moves (`InvalidTransition`)
    /// - return `Conflict` carrying the observed status when it differs from `expected`
    /// - keep `updated_at` non-decreasing
    fn update_status(
        &self,
        id: JobId,
        expected: JobStatus,
        new: JobStatus,
    ) -> Result<(), JobStoreError>;

    /// Atomically count one more delivery attempt; returns the new count.
    fn record_attempt(&self, id: JobId) -> Result<u32, JobStoreError>;

    /// Most recently submitted jobs first.
    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Counts per status.
    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).create(job)
    }

    fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        (**self).get(id)
    }

    fn update_status(
        &self,
        id: JobId,
        expected: JobStatus,
        new: JobStatus,
    ) -> Result<(), JobStoreError> {
        (**self).update_status(id, expected, new)
    }

    fn record_attempt(&self, id: JobId) -> Result<u32, JobStoreError> {
        (**self).record_attempt(id)
    }

    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(limit)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

/// Reject edges that are not forward moves before touching storage.
pub(crate) fn check_transition(
    id: JobId,
    expected: JobStatus,
    new: JobStatus,
) -> Result<(), JobStoreError> {
    if expected.can_transition_to(new) {
        Ok(())
    } else {
        Err(JobStoreError::InvalidTransition {
            id,
            from: expected,
            to: new,
        })
    }
}
