//! Job lifecycle: submission, status reporting, and delivery processing.
//!
//! ## Components
//!
//! - `JobCoordinator`: the only writer of status transitions (CAS-based)
//! - `DeliveryWorker`: drains a `DeliveryQueue` through the coordinator
//! - `RetryPolicy`: backoff for transient backend failures
//!
//! ## Idempotency
//!
//! Every status write is a compare-and-swap against the expected current
//! status. Duplicate reports for a transition that already happened are
//! answered with `Transition::AlreadyApplied` instead of an error.

pub mod coordinator;
pub mod types;
pub mod worker;

pub use coordinator::{delivery_payload, CoordinatorError, JobCoordinator};
pub use types::{BackoffStrategy, JobResult, RetryPolicy, Transition};
pub use worker::{
    DeliveryOutcome, DeliveryWorker, DeliveryWorkerConfig, JobHandler, WorkerHandle, WorkerStats,
};
