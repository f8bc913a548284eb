//! `reporter-core`: job lifecycle domain primitives.
//!
//! This crate contains **pure domain** types (no IO, no storage, no queues).

pub mod error;
pub mod id;
pub mod job;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{Job, JobStatus};
