//! Job record storage boundary.
//!
//! This module defines the storage abstraction for job records and its
//! backends. The trait makes no storage assumptions beyond per-record
//! compare-and-swap.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use r#trait::{JobStats, JobStore, JobStoreError};
