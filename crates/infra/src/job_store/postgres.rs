//! Postgres-backed job store implementation.
//!
//! Status updates are single-statement compare-and-swaps
//! (`UPDATE … WHERE id = $1 AND status = $2`), so isolation is row-level and
//! concurrent reporters for the same job are ordered by the database.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) on insert | `23505` | `AlreadyExists` |
//! | PoolTimedOut / PoolClosed / Io / Tls / WorkerCrashed | N/A | `Unavailable` |
//! | Call exceeded `call_timeout` | N/A | `Unavailable` |
//! | Anything else | Any | `Storage` |
//!
//! ## Blocking bridge
//!
//! `JobStore` is synchronous. Each call runs the async query on the runtime
//! captured at construction via `block_in_place` + `Handle::block_on`, which is
//! valid from plain threads, `spawn_blocking` closures, and multi-thread
//! runtime workers. It panics on a current-thread runtime.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use reporter_core::{Job, JobId, JobStatus};

use super::r#trait::{check_transition, JobStats, JobStore, JobStoreError};
use crate::config::PostgresConfig;

/// Schema for the `jobs` table (idempotent).
pub const SCHEMA: &str = include_str!("../../migrations/0001_create_jobs.sql");

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    handle: Handle,
    call_timeout: Duration,
}

impl PostgresJobStore {
    /// Wrap an existing pool. Must be called from within a tokio runtime.
    pub fn new(pool: PgPool, call_timeout: Duration) -> Self {
        Self {
            pool,
            handle: Handle::current(),
            call_timeout,
        }
    }

    /// Open a pool from `config`.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.call_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self::new(pool, config.call_timeout))
    }

    /// Create the `jobs` table and index if missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    pub async fn insert_job(&self, job: Job) -> Result<JobId, JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, resource_ref, status, submitted_at, updated_at, attempts)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.resource_ref)
        .bind(job.status.as_str())
        .bind(job.submitted_at)
        .bind(job.updated_at)
        .bind(job.attempts as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(job.id)
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_job(&self, id: JobId) -> Result<Job, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, resource_ref, status, submitted_at, updated_at, attempts
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(JobStoreError::NotFound(id)),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn compare_and_swap_status(
        &self,
        id: JobId,
        expected: JobStatus,
        new: JobStatus,
    ) -> Result<(), JobStoreError> {
        check_transition(id, expected, new)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $3, updated_at = GREATEST(updated_at, $4)
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(new.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("compare_and_swap_status", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Nothing matched: either the job is missing or its status moved on.
        let actual = self.fetch_job(id).await?.status;
        Err(JobStoreError::Conflict {
            id,
            expected,
            actual,
        })
    }

    #[instrument(skip(self), err)]
    pub async fn increment_attempts(&self, id: JobId) -> Result<u32, JobStoreError> {
        let row = sqlx::query("UPDATE jobs SET attempts = attempts + 1 WHERE id = $1 RETURNING attempts")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("increment_attempts", e))?;

        let row = row.ok_or(JobStoreError::NotFound(id))?;
        let attempts: i32 = row
            .try_get("attempts")
            .map_err(|e| JobStoreError::Storage(format!("failed to read attempts: {e}")))?;
        Ok(attempts.max(0) as u32)
    }

    #[instrument(skip(self), err)]
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, resource_ref, status, submitted_at, updated_at, attempts
            FROM jobs
            ORDER BY submitted_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_recent", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn count_by_status(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Storage(format!("failed to read status: {e}")))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| JobStoreError::Storage(format!("failed to read count: {e}")))?;
            let status: JobStatus = status
                .parse()
                .map_err(|e| JobStoreError::Storage(format!("{e}")))?;
            stats.count(status, n.max(0) as usize);
        }
        Ok(stats)
    }

    /// Run `fut` to completion on the captured runtime, bounded by `call_timeout`.
    fn run<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, JobStoreError>>,
    ) -> Result<T, JobStoreError> {
        let timeout = self.call_timeout;
        let bounded = async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(JobStoreError::Unavailable(format!(
                    "{operation} timed out after {timeout:?}"
                ))),
            }
        };
        tokio::task::block_in_place(|| self.handle.block_on(bounded))
    }
}

impl JobStore for PostgresJobStore {
    fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        self.run("create", self.insert_job(job))
    }

    fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.run("get", self.fetch_job(id))
    }

    fn update_status(
        &self,
        id: JobId,
        expected: JobStatus,
        new: JobStatus,
    ) -> Result<(), JobStoreError> {
        self.run("update_status", self.compare_and_swap_status(id, expected, new))
    }

    fn record_attempt(&self, id: JobId) -> Result<u32, JobStoreError> {
        self.run("record_attempt", self.increment_attempts(id))
    }

    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.run("list", self.list_recent(limit))
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.run("stats", self.count_by_status())
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let decode = |field: &str, e: sqlx::Error| {
        JobStoreError::Storage(format!("failed to read {field}: {e}"))
    };

    let id: Uuid = row.try_get("id").map_err(|e| decode("id", e))?;
    let resource_ref: String = row
        .try_get("resource_ref")
        .map_err(|e| decode("resource_ref", e))?;
    let status: String = row.try_get("status").map_err(|e| decode("status", e))?;
    let submitted_at: DateTime<Utc> = row
        .try_get("submitted_at")
        .map_err(|e| decode("submitted_at", e))?;
    let updated_at: DateTime<Utc> = row
        .try_get("updated_at")
        .map_err(|e| decode("updated_at", e))?;
    let attempts: i32 = row.try_get("attempts").map_err(|e| decode("attempts", e))?;

    Ok(Job {
        id: JobId::from_uuid(id),
        resource_ref,
        status: status
            .parse()
            .map_err(|e| JobStoreError::Storage(format!("{e}")))?,
        submitted_at,
        updated_at,
        attempts: attempts.max(0) as u32,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => {
            JobStoreError::Unavailable(format!("{operation}: {err}"))
        }
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
