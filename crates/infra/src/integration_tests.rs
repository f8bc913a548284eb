//! Integration tests for the full job lifecycle.
//!
//! Tests: submit → JobStore → DeliveryQueue → worker → report → JobStore
//!
//! Verifies:
//! - A submitted job reaches exactly one terminal status
//! - Duplicate and redelivered reports are absorbed idempotently
//! - A failed enqueue never leaves a `Queued` job without a delivery

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::Value as JsonValue;

    use reporter_core::{Job, JobId, JobStatus};

    use crate::config::{CoordinatorConfig, QueueConfig};
    use crate::delivery::{
        AckHandle, Delivery, DeliveryQueue, InMemoryDeliveryQueue, QueueError,
    };
    use crate::job_store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
    use crate::jobs::{
        CoordinatorError, DeliveryWorker, DeliveryWorkerConfig, JobCoordinator, JobResult,
        RetryPolicy, Transition,
    };

    type Coordinator = JobCoordinator<Arc<InMemoryJobStore>, Arc<InMemoryDeliveryQueue>>;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig::default().with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)))
    }

    fn setup_with_visibility(visibility: Duration) -> Arc<Coordinator> {
        let queue = InMemoryDeliveryQueue::new(
            QueueConfig::default().with_visibility_timeout(visibility),
        );
        Arc::new(JobCoordinator::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(queue),
            config(),
        ))
    }

    fn setup() -> Arc<Coordinator> {
        setup_with_visibility(Duration::from_secs(60))
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    /// Queue whose `enqueue` always fails.
    #[derive(Debug, Default)]
    struct DownQueue;

    impl DeliveryQueue for DownQueue {
        fn enqueue(&self, _job_id: JobId, _payload: JsonValue) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("connection refused".to_string()))
        }

        fn receive(&self, _wait: Duration) -> Result<Option<Delivery>, QueueError> {
            Ok(None)
        }

        fn ack(&self, handle: AckHandle) -> Result<(), QueueError> {
            Err(QueueError::UnknownHandle(handle.message_id().to_string()))
        }

        fn nack(&self, handle: AckHandle) -> Result<(), QueueError> {
            Err(QueueError::UnknownHandle(handle.message_id().to_string()))
        }
    }

    /// Queue that accepts the message but reports a timeout, and a worker
    /// starts the job before the caller sees the error.
    #[derive(Debug)]
    struct LandsThenTimesOut {
        store: Arc<InMemoryJobStore>,
    }

    impl DeliveryQueue for LandsThenTimesOut {
        fn enqueue(&self, job_id: JobId, _payload: JsonValue) -> Result<(), QueueError> {
            self.store
                .update_status(job_id, JobStatus::Queued, JobStatus::InProgress)
                .map_err(|e| QueueError::Backend(e.to_string()))?;
            Err(QueueError::Unavailable("response timed out".to_string()))
        }

        fn receive(&self, _wait: Duration) -> Result<Option<Delivery>, QueueError> {
            Ok(None)
        }

        fn ack(&self, _handle: AckHandle) -> Result<(), QueueError> {
            Ok(())
        }

        fn nack(&self, _handle: AckHandle) -> Result<(), QueueError> {
            Ok(())
        }
    }

    /// Store whose first status write commits but reports a timeout.
    #[derive(Debug, Default)]
    struct LostReplyStore {
        inner: InMemoryJobStore,
        reply_lost: AtomicBool,
    }

    impl JobStore for LostReplyStore {
        fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
            self.inner.create(job)
        }

        fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
            self.inner.get(id)
        }

        fn update_status(
            &self,
            id: JobId,
            expected: JobStatus,
            new: JobStatus,
        ) -> Result<(), JobStoreError> {
            self.inner.update_status(id, expected, new)?;
            if !self.reply_lost.swap(true, Ordering::SeqCst) {
                return Err(JobStoreError::Unavailable("statement timeout".to_string()));
            }
            Ok(())
        }

        fn record_attempt(&self, id: JobId) -> Result<u32, JobStoreError> {
            self.inner.record_attempt(id)
        }

        fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list(limit)
        }

        fn stats(&self) -> Result<JobStats, JobStoreError> {
            self.inner.stats()
        }
    }

    #[test]
    fn submitted_job_flows_to_succeeded_through_worker() {
        let coordinator = setup();
        let id = coordinator.submit("gs://bucket/a.csv").unwrap();
        assert_eq!(coordinator.get_status(id).unwrap().status, JobStatus::Queued);

        let handle = DeliveryWorker::new(coordinator.clone(), |job| {
            assert_eq!(job.status, JobStatus::InProgress);
            JobResult::Success
        })
        .spawn(DeliveryWorkerConfig::default().with_poll_interval(Duration::from_millis(10)))
        .unwrap();

        let finished = wait_until(Duration::from_secs(5), || {
            coordinator.get_status(id).unwrap().status == JobStatus::Succeeded
        });
        handle.shutdown();

        assert!(finished, "job should reach Succeeded");
        let job = coordinator.get_status(id).unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.updated_at >= job.submitted_at);
        assert!(coordinator.queue().is_empty());
    }

    #[test]
    fn manual_lifecycle_queued_in_progress_succeeded() {
        let coordinator = setup();
        let id = coordinator.submit("gs://bucket/a.csv").unwrap();

        let delivery = coordinator.queue().receive(Duration::ZERO).unwrap().unwrap();
        assert_eq!(delivery.job_id, id);

        assert_eq!(coordinator.report_started(id).unwrap(), Transition::Applied);
        assert_eq!(coordinator.get_status(id).unwrap().status, JobStatus::InProgress);

        assert_eq!(coordinator.report_completed(id, true).unwrap(), Transition::Applied);
        coordinator.queue().ack(delivery.handle).unwrap();

        assert_eq!(coordinator.get_status(id).unwrap().status, JobStatus::Succeeded);
    }

    #[test]
    fn duplicate_report_started_is_swallowed() {
        let coordinator = setup();
        let id = coordinator.submit("gs://bucket/a.csv").unwrap();

        coordinator.report_started(id).unwrap();
        assert_eq!(
            coordinator.report_started(id).unwrap(),
            Transition::AlreadyApplied
        );
        assert_eq!(coordinator.get_status(id).unwrap().status, JobStatus::InProgress);
    }

    #[test]
    fn redelivery_after_visibility_timeout_reaches_one_terminal_status() {
        let coordinator = setup_with_visibility(Duration::from_millis(50));
        let id = coordinator.submit("gs://bucket/a.csv").unwrap();
        let queue = coordinator.queue();

        // Consumer A starts the job and stalls past the visibility timeout.
        let stalled = queue.receive(Duration::ZERO).unwrap().unwrap();
        coordinator.report_started(id).unwrap();

        // Consumer B gets the redelivery and finishes it.
        let redelivered = queue.receive(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(redelivered.job_id, id);
        assert_eq!(redelivered.attempt, 2);
        assert_eq!(
            coordinator.report_started(id).unwrap(),
            Transition::AlreadyApplied
        );
        coordinator.report_completed(id, true).unwrap();
        queue.ack(redelivered.handle).unwrap();

        // A wakes up, reports a contradicting outcome, and tries to ack.
        let late = coordinator.report_completed(id, false);
        assert!(matches!(
            late,
            Err(CoordinatorError::Conflict {
                actual: JobStatus::Succeeded,
                ..
            })
        ));
        assert!(matches!(
            queue.ack(stalled.handle),
            Err(QueueError::UnknownHandle(_))
        ));

        let job = coordinator.get_status(id).unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn forced_enqueue_failure_leaves_job_failed() {
        let coordinator = JobCoordinator::new(InMemoryJobStore::new(), DownQueue, config());

        let err = coordinator.submit("gs://bucket/a.csv").unwrap_err();
        let id = err.job_id().expect("enqueue failure carries the job id");
        assert!(matches!(err, CoordinatorError::EnqueueFailed { .. }));

        let job = coordinator.get_status(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(coordinator.stats().unwrap().failed, 1);
    }

    #[test]
    fn ambiguous_enqueue_that_landed_is_reported_as_submitted() {
        let store = Arc::new(InMemoryJobStore::new());
        let coordinator = JobCoordinator::new(
            store.clone(),
            LandsThenTimesOut {
                store: store.clone(),
            },
            CoordinatorConfig::default().with_retry(RetryPolicy::no_retry()),
        );

        let job = coordinator.submit_job("gs://bucket/a.csv").unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(store.get(job.id).unwrap().status, JobStatus::InProgress);
    }

    #[test]
    fn rollback_whose_reply_was_lost_still_reports_enqueue_failure() {
        let store = Arc::new(LostReplyStore::default());
        let coordinator = JobCoordinator::new(store.clone(), DownQueue, config());

        let err = coordinator.submit("gs://bucket/a.csv").unwrap_err();
        assert!(matches!(err, CoordinatorError::EnqueueFailed { .. }));

        let id = err.job_id().unwrap();
        assert_eq!(store.get(id).unwrap().status, JobStatus::Failed);
        assert!(store.reply_lost.load(Ordering::SeqCst));
    }

    #[test]
    fn racing_completions_have_exactly_one_winner() {
        for _ in 0..20 {
            let coordinator = setup();
            let id = coordinator.submit("gs://bucket/race.csv").unwrap();
            coordinator.report_started(id).unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let racers: Vec<_> = [true, false]
                .into_iter()
                .map(|success| {
                    let coordinator = coordinator.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        (success, coordinator.report_completed(id, success))
                    })
                })
                .collect();

            let results: Vec<_> = racers.into_iter().map(|r| r.join().unwrap()).collect();
            let winners: Vec<_> = results
                .iter()
                .filter(|(_, r)| matches!(r, Ok(Transition::Applied)))
                .collect();
            assert_eq!(winners.len(), 1);

            let (winning_outcome, _) = winners[0];
            let final_status = coordinator.get_status(id).unwrap().status;
            assert_eq!(final_status, JobStatus::completion(*winning_outcome));

            let (_, loser) = results
                .iter()
                .find(|(s, _)| s != winning_outcome)
                .unwrap();
            assert!(matches!(loser, Err(CoordinatorError::Conflict { .. })));
        }
    }

    #[test]
    fn competing_workers_finish_every_job_once() {
        let coordinator = setup();
        let ids: Vec<_> = (0..40)
            .map(|i| coordinator.submit(format!("gs://bucket/{i}.csv")).unwrap())
            .collect();

        let handles: Vec<_> = (0..4)
            .map(|n| {
                DeliveryWorker::new(coordinator.clone(), |_job| JobResult::Success)
                    .spawn(
                        DeliveryWorkerConfig::default()
                            .with_name(format!("worker-{n}"))
                            .with_poll_interval(Duration::from_millis(10)),
                    )
                    .unwrap()
            })
            .collect();

        let processed = || handles.iter().map(|h| h.stats().jobs_succeeded).sum::<u64>();
        let drained = wait_until(Duration::from_secs(10), || processed() == ids.len() as u64);
        let total = processed();
        for handle in handles {
            handle.shutdown();
        }

        assert!(drained, "all jobs should succeed");
        assert_eq!(total, ids.len() as u64);
        assert_eq!(coordinator.stats().unwrap().succeeded, ids.len());
        for id in ids {
            let job = coordinator.get_status(id).unwrap();
            assert_eq!(job.status, JobStatus::Succeeded);
            assert_eq!(job.attempts, 1);
        }
    }
}
