//! HTTP API: job submission and status endpoints over the job coordinator.

pub mod app;
pub mod config;
