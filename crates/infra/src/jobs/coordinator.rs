//! Job coordinator: submission and status reporting.
//!
//! The coordinator is the only component that writes status transitions. All
//! writes are compare-and-swap against the expected current status, so racing
//! or duplicated reports resolve to exactly one applied transition.

use std::thread;

use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use reporter_core::{Job, JobId, JobStatus};

use super::types::{RetryPolicy, Transition};
use crate::config::CoordinatorConfig;
use crate::delivery::{DeliveryQueue, QueueError};
use crate::job_store::{JobStats, JobStore, JobStoreError};

/// Coordinator-level error classification.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoordinatorError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The job was observed in a status other than the one the transition expects.
    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    /// A backend stayed unavailable after all retries.
    #[error("backend unavailable: {0}")]
    Transient(String),

    /// Identity or transition-table violation; indicates a bug or corruption.
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// The job was recorded but could not be enqueued; it is now `Failed`.
    #[error("job {id} could not be enqueued: {reason}")]
    EnqueueFailed { id: JobId, reason: String },
}

impl CoordinatorError {
    /// Id of the job the error refers to, when known.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            CoordinatorError::NotFound(id)
            | CoordinatorError::Conflict { id, .. }
            | CoordinatorError::EnqueueFailed { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl From<JobStoreError> for CoordinatorError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::NotFound(id) => CoordinatorError::NotFound(id),
            JobStoreError::Conflict {
                id,
                expected,
                actual,
            } => CoordinatorError::Conflict {
                id,
                expected,
                actual,
            },
            JobStoreError::AlreadyExists(_) | JobStoreError::InvalidTransition { .. } => {
                CoordinatorError::Integrity(e.to_string())
            }
            JobStoreError::Unavailable(msg) => CoordinatorError::Transient(msg),
            JobStoreError::Storage(msg) => CoordinatorError::Storage(msg),
        }
    }
}

/// Message body handed to workers for each enqueued job.
pub fn delivery_payload(job: &Job) -> JsonValue {
    json!({
        "job_id": job.id,
        "resource_ref": job.resource_ref,
        "submitted_at": job.submitted_at,
    })
}

/// Writes job records and status transitions; hands new jobs to the queue.
#[derive(Debug)]
pub struct JobCoordinator<S, Q> {
    store: S,
    queue: Q,
    config: CoordinatorConfig,
}

impl<S: JobStore, Q: DeliveryQueue> JobCoordinator<S, Q> {
    pub fn new(store: S, queue: Q, config: CoordinatorConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Record a new `Queued` job and enqueue its delivery.
    ///
    /// The record is written before the enqueue. If the enqueue keeps failing,
    /// the job is moved to `Failed` and [`CoordinatorError::EnqueueFailed`] is
    /// returned, so a later `get_status` never shows a `Queued` job that no
    /// worker will receive.
    pub fn submit(&self, resource_ref: impl Into<String>) -> Result<JobId, CoordinatorError> {
        self.submit_job(resource_ref).map(|job| job.id)
    }

    /// Like [`submit`](Self::submit), returning the job with the status it was
    /// last observed in. That is `Queued` unless an enqueue reported as failed
    /// had in fact landed and a worker already moved the job on.
    pub fn submit_job(&self, resource_ref: impl Into<String>) -> Result<Job, CoordinatorError> {
        let mut job = Job::new(resource_ref);
        let id = job.id;
        let payload = delivery_payload(&job);

        self.store.create(job.clone()).map_err(|e| {
            if matches!(e, JobStoreError::AlreadyExists(_)) {
                error!(job_id = %id, "generated job id already exists");
            }
            CoordinatorError::from(e)
        })?;
        debug!(job_id = %id, "job recorded");

        let enqueued = retrying(&self.config.retry, "enqueue", id, QueueError::is_transient, || {
            self.queue.enqueue(id, payload.clone())
        });

        match enqueued {
            Ok(()) => {
                info!(job_id = %id, status = %JobStatus::Queued, "job submitted");
            }
            Err(e) => job.status = self.roll_back(id, e)?,
        }
        Ok(job)
    }

    /// Move a job whose enqueue failed to `Failed`. Returns the status a worker
    /// already advanced it to when the enqueue turns out to have landed.
    fn roll_back(&self, id: JobId, cause: QueueError) -> Result<JobStatus, CoordinatorError> {
        warn!(job_id = %id, error = %cause, "enqueue failed; marking job failed");

        let rolled_back = retrying(
            &self.config.retry,
            "rollback",
            id,
            JobStoreError::is_transient,
            || self.store.update_status(id, JobStatus::Queued, JobStatus::Failed),
        );

        let enqueue_failed = || CoordinatorError::EnqueueFailed {
            id,
            reason: cause.to_string(),
        };

        match rolled_back {
            Ok(()) => Err(enqueue_failed()),
            // An earlier rollback attempt committed but its reply was lost.
            Err(JobStoreError::Conflict {
                actual: JobStatus::Failed,
                ..
            }) => {
                debug!(job_id = %id, "rollback already applied");
                Err(enqueue_failed())
            }
            // A worker already picked the job up: the failed enqueue actually landed.
            Err(JobStoreError::Conflict { actual, .. }) => {
                info!(job_id = %id, status = %actual, "enqueue landed despite error; keeping job");
                Ok(actual)
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "rollback failed; job left queued without a delivery");
                Err(e.into())
            }
        }
    }

    /// Record a delivery attempt and move the job `Queued → InProgress`.
    ///
    /// A duplicate report for a job that is already `InProgress` is swallowed.
    pub fn report_started(&self, id: JobId) -> Result<Transition, CoordinatorError> {
        let attempt = retrying(
            &self.config.retry,
            "record_attempt",
            id,
            JobStoreError::is_transient,
            || self.store.record_attempt(id),
        )?;

        let result = retrying(
            &self.config.retry,
            "report_started",
            id,
            JobStoreError::is_transient,
            || self.store.update_status(id, JobStatus::Queued, JobStatus::InProgress),
        );

        match result {
            Ok(()) => {
                info!(job_id = %id, attempt, status = %JobStatus::InProgress, "job started");
                Ok(Transition::Applied)
            }
            Err(JobStoreError::Conflict {
                actual: JobStatus::InProgress,
                ..
            }) => {
                debug!(job_id = %id, attempt, "duplicate start report");
                Ok(Transition::AlreadyApplied)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move the job `InProgress → Succeeded | Failed`.
    ///
    /// A duplicate report asking for the outcome already stored is swallowed;
    /// a report contradicting it surfaces as `Conflict`.
    pub fn report_completed(&self, id: JobId, success: bool) -> Result<Transition, CoordinatorError> {
        let target = JobStatus::completion(success);

        let result = retrying(
            &self.config.retry,
            "report_completed",
            id,
            JobStoreError::is_transient,
            || self.store.update_status(id, JobStatus::InProgress, target),
        );

        match result {
            Ok(()) => {
                info!(job_id = %id, status = %target, "job completed");
                Ok(Transition::Applied)
            }
            Err(JobStoreError::Conflict { actual, .. }) if actual == target => {
                debug!(job_id = %id, status = %target, "duplicate completion report");
                Ok(Transition::AlreadyApplied)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_status(&self, id: JobId) -> Result<Job, CoordinatorError> {
        Ok(self.store.get(id)?)
    }

    /// Most recent jobs first; `limit` is clamped to the configured maximum.
    pub fn list(&self, limit: usize) -> Result<Vec<Job>, CoordinatorError> {
        Ok(self.store.list(limit.min(self.config.max_list_limit))?)
    }

    pub fn stats(&self) -> Result<JobStats, CoordinatorError> {
        Ok(self.store.stats()?)
    }
}

/// Run `op`, sleeping per `policy` between attempts while the error is transient.
fn retrying<T, E>(
    policy: &RetryPolicy,
    op_name: &'static str,
    id: JobId,
    is_transient: impl Fn(&E) -> bool,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E>
where
    E: core::fmt::Display,
{
    let mut retries = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && policy.should_retry(retries) => {
                retries += 1;
                let delay = policy.delay_for_attempt(retries);
                warn!(
                    job_id = %id,
                    op = op_name,
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure; retrying"
                );
                thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}
