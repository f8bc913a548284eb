use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reporter_core::{Job, JobId, JobStatus};
use reporter_infra::job_store::JobStats;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    /// Opaque storage locator; may be empty
    #[serde(default)]
    pub resource_ref: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: JobId,
    pub resource_ref: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            resource_ref: job.resource_ref,
            status: job.status,
            submitted_at: job.submitted_at,
            updated_at: job.updated_at,
            attempts: job.attempts,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub count: usize,
}

impl From<Vec<Job>> for JobListResponse {
    fn from(jobs: Vec<Job>) -> Self {
        let jobs: Vec<JobResponse> = jobs.into_iter().map(JobResponse::from).collect();
        Self {
            count: jobs.len(),
            jobs,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobStatsResponse {
    #[serde(flatten)]
    pub counts: JobStats,
    pub total: usize,
}

impl From<JobStats> for JobStatsResponse {
    fn from(counts: JobStats) -> Self {
        Self {
            total: counts.total(),
            counts,
        }
    }
}
