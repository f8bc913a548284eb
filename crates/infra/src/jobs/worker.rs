//! Delivery worker: drains a queue through the coordinator.

use std::io;
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use reporter_core::{Job, JobStatus};

use super::coordinator::{CoordinatorError, JobCoordinator};
use super::types::JobResult;
use crate::delivery::{AckHandle, Delivery, DeliveryQueue, QueueError};
use crate::job_store::JobStore;

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&Job) -> JobResult + Send + Sync>;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct DeliveryWorkerConfig {
    /// How long each receive blocks before re-checking for shutdown
    pub poll_interval: Duration,
    /// Thread name, also used in logs
    pub name: String,
}

impl Default for DeliveryWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            name: "delivery-worker".to_string(),
        }
    }
}

impl DeliveryWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The handler ran and the job reached this terminal status.
    Completed(JobStatus),
    /// The job was already terminal; the delivery was acked without running the handler.
    Duplicate,
    /// The delivery was given back to the queue.
    Requeued,
    /// No job record exists for the delivery; it was acked and discarded.
    Dropped,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub deliveries_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub duplicates: u64,
    pub requeued: u64,
    pub dropped: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &Result<DeliveryOutcome, CoordinatorError>) {
        self.deliveries_processed += 1;
        match outcome {
            Ok(DeliveryOutcome::Completed(JobStatus::Succeeded)) => self.jobs_succeeded += 1,
            Ok(DeliveryOutcome::Completed(_)) => self.jobs_failed += 1,
            Ok(DeliveryOutcome::Duplicate) => self.duplicates += 1,
            Ok(DeliveryOutcome::Requeued) => self.requeued += 1,
            Ok(DeliveryOutcome::Dropped) => self.dropped += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A delivery being processed is finished first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Background worker.
///
/// Each delivery is reported started, passed to the handler, reported
/// completed, then acked. Handlers must tolerate being run more than once for
/// the same job (at-least-once delivery).
pub struct DeliveryWorker<S, Q> {
    coordinator: Arc<JobCoordinator<S, Q>>,
    handler: JobHandler,
}

impl<S, Q> core::fmt::Debug for DeliveryWorker<S, Q> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeliveryWorker").finish_non_exhaustive()
    }
}

impl<S, Q> DeliveryWorker<S, Q>
where
    S: JobStore + 'static,
    Q: DeliveryQueue + 'static,
{
    pub fn new<F>(coordinator: Arc<JobCoordinator<S, Q>>, handler: F) -> Self
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        Self {
            coordinator,
            handler: Box::new(handler),
        }
    }

    /// Spawn the worker in a background thread.
    pub fn spawn(self, config: DeliveryWorkerConfig) -> io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker_loop(self, config, shutdown_rx, stats_clone))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    /// Process a single delivery (for testing or synchronous use).
    pub fn process(&self, delivery: Delivery) -> Result<DeliveryOutcome, CoordinatorError> {
        let queue = self.coordinator.queue();
        let attempt = delivery.attempt;
        let (job_id, _payload, handle) = delivery.into_parts();

        match self.coordinator.report_started(job_id) {
            Ok(_) => {}
            Err(CoordinatorError::Conflict { actual, .. }) if actual.is_terminal() => {
                debug!(job_id = %job_id, attempt, status = %actual, "duplicate delivery of finished job");
                settle(queue, handle, Settle::Ack);
                return Ok(DeliveryOutcome::Duplicate);
            }
            Err(CoordinatorError::NotFound(_)) => {
                warn!(job_id = %job_id, "delivery for unknown job; discarding");
                settle(queue, handle, Settle::Ack);
                return Ok(DeliveryOutcome::Dropped);
            }
            Err(e) => {
                settle(queue, handle, Settle::Nack);
                return Err(e);
            }
        }

        let job = match self.coordinator.get_status(job_id) {
            Ok(job) => job,
            Err(e) => {
                settle(queue, handle, Settle::Nack);
                return Err(e);
            }
        };

        let success = match (self.handler)(&job) {
            JobResult::Success => true,
            JobResult::Failure(reason) => {
                warn!(job_id = %job_id, attempt, reason = %reason, "job handler failed");
                false
            }
            JobResult::Retry => {
                debug!(job_id = %job_id, attempt, "handler requested redelivery");
                settle(queue, handle, Settle::Nack);
                return Ok(DeliveryOutcome::Requeued);
            }
        };

        match self.coordinator.report_completed(job_id, success) {
            Ok(_) => {
                settle(queue, handle, Settle::Ack);
                Ok(DeliveryOutcome::Completed(JobStatus::completion(success)))
            }
            // A concurrent delivery of the same job finished first with the other outcome.
            Err(CoordinatorError::Conflict { actual, .. }) if actual.is_terminal() => {
                settle(queue, handle, Settle::Ack);
                Ok(DeliveryOutcome::Duplicate)
            }
            Err(e) => {
                settle(queue, handle, Settle::Nack);
                Err(e)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Nack,
}

/// Settle a delivery. Failures only delay redelivery, so they are logged.
fn settle<Q: DeliveryQueue>(queue: &Q, handle: AckHandle, how: Settle) {
    let message_id = handle.message_id().to_string();
    let result = match how {
        Settle::Ack => queue.ack(handle),
        Settle::Nack => queue.nack(handle),
    };
    match result {
        Ok(()) => {}
        Err(QueueError::UnknownHandle(_)) => {
            debug!(message_id = %message_id, ?how, "delivery lease expired before settling");
        }
        Err(e) => {
            warn!(message_id = %message_id, ?how, error = %e, "failed to settle delivery");
        }
    }
}

fn worker_loop<S, Q>(
    worker: DeliveryWorker<S, Q>,
    config: DeliveryWorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) where
    S: JobStore + 'static,
    Q: DeliveryQueue + 'static,
{
    info!(worker = %config.name, "delivery worker started");
    let start_time = Instant::now();

    loop {
        // A dropped handle counts as a shutdown request.
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .uptime_secs = start_time.elapsed().as_secs();

        match worker.coordinator.queue().receive(config.poll_interval) {
            Ok(Some(delivery)) => {
                let outcome = worker.process(delivery);
                if let Err(ref e) = outcome {
                    warn!(worker = %config.name, error = %e, "delivery processing failed");
                }
                stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(&outcome);
            }
            Ok(None) => continue,
            Err(QueueError::Closed) => break,
            Err(e) => {
                error!(worker = %config.name, error = %e, "failed to receive delivery");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(worker = %config.name, "delivery worker stopped");
}
