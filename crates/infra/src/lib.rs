//! Infrastructure layer: job storage, delivery queues, and the job coordinator.

pub mod config;
pub mod delivery;
pub mod job_store;
pub mod jobs;

mod integration_tests;
