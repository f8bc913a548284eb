//! Job record and its forward-only status lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Lifecycle status of a job.
///
/// ```text
/// Queued ──► InProgress ──► Succeeded
///   │             │
///   │             └───────► Failed
///   └─────────────────────► Failed   (delivery could not be enqueued)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Recorded and handed to the delivery queue, not yet picked up.
    Queued,
    /// A worker reported that it started processing.
    InProgress,
    /// Completed successfully.
    Succeeded,
    /// Completed unsuccessfully, or never delivered.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::InProgress,
        JobStatus::Succeeded,
        JobStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Position along the lifecycle; terminal states share the last rank.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::InProgress => 1,
            JobStatus::Succeeded | JobStatus::Failed => 2,
        }
    }

    /// Whether `self -> next` is a permitted edge.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::InProgress)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::InProgress, JobStatus::Succeeded)
                | (JobStatus::InProgress, JobStatus::Failed)
        )
    }

    /// Terminal status for a completion report.
    pub fn completion(success: bool) -> Self {
        if success {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "in_progress" => Ok(JobStatus::InProgress),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::invalid_id(format!("JobStatus: unknown value '{other}'"))),
        }
    }
}

/// A submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// External location of the uploaded payload (may be empty)
    pub resource_ref: String,
    /// Current status
    pub status: JobStatus,
    /// When the job was submitted
    pub submitted_at: DateTime<Utc>,
    /// When the status last changed
    pub updated_at: DateTime<Utc>,
    /// Delivery attempts observed so far
    pub attempts: u32,
}

impl Job {
    /// Create a new queued job with a fresh identifier.
    pub fn new(resource_ref: impl Into<String>) -> Self {
        Self::with_id(JobId::new(), resource_ref, Utc::now())
    }

    /// Create a queued job with an explicit identifier and submission time.
    pub fn with_id(id: JobId, resource_ref: impl Into<String>, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id,
            resource_ref: resource_ref.into(),
            status: JobStatus::Queued,
            submitted_at,
            updated_at: submitted_at,
            attempts: 0,
        }
    }

    /// Move to `next`, stamping `updated_at` with `now`.
    ///
    /// `updated_at` never moves backwards even if the wall clock does.
    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(self.status, next));
        }
        self.status = next;
        self.updated_at = self.updated_at.max(now);
        Ok(())
    }

    /// Count one more observed delivery attempt.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }
}
