use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tracing::debug;

use reporter_core::JobId;

use super::r#trait::{AckHandle, Delivery, DeliveryQueue, QueueError};
use crate::config::QueueConfig;

#[derive(Debug)]
struct Message {
    job_id: JobId,
    payload: JsonValue,
    deliveries: u32,
    /// Set while a consumer holds the message; expiry makes it visible again.
    lease_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    messages: HashMap<u64, Message>,
    ready: VecDeque<u64>,
    closed: bool,
}

impl State {
    /// Return expired leases to the back of the ready queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let mut expired: Vec<u64> = self
            .messages
            .iter()
            .filter(|(_, m)| m.lease_until.is_some_and(|until| until <= now))
            .map(|(seq, _)| *seq)
            .collect();
        expired.sort_unstable();

        for seq in expired {
            if let Some(message) = self.messages.get_mut(&seq) {
                message.lease_until = None;
                debug!(job_id = %message.job_id, deliveries = message.deliveries, "visibility timeout expired; redelivering");
                self.ready.push_back(seq);
            }
        }
    }

    fn next_lease_expiry(&self) -> Option<Instant> {
        self.messages.values().filter_map(|m| m.lease_until).min()
    }

    /// Validate that `handle` refers to the current, still-leased delivery.
    fn leased_message(&mut self, handle: &AckHandle) -> Result<(u64, &mut Message), QueueError> {
        let stale = || QueueError::UnknownHandle(format!("{}#{}", handle.message_id(), handle.delivery()));

        let seq: u64 = handle.message_id().parse().map_err(|_| stale())?;
        let message = self.messages.get_mut(&seq).ok_or_else(stale)?;
        if message.deliveries != handle.delivery() || message.lease_until.is_none() {
            return Err(stale());
        }
        Ok((seq, message))
    }
}

/// In-memory delivery queue with visibility-timeout leases.
///
/// - No IO
/// - FIFO among visible messages
/// - Blocking receive via `Condvar`
///
/// Intended for tests/dev; contents are lost with the process.
#[derive(Debug)]
pub struct InMemoryDeliveryQueue {
    state: Mutex<State>,
    available: Condvar,
    config: QueueConfig,
}

impl InMemoryDeliveryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Stop accepting messages and wake every blocked consumer.
    pub fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.available.notify_all();
    }

    /// Messages not yet acked (visible or leased).
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently leased by a consumer.
    pub fn in_flight(&self) -> usize {
        self.lock()
            .map(|s| s.messages.values().filter(|m| m.lease_until.is_some()).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state.lock().map_err(poisoned)
    }
}

impl Default for InMemoryDeliveryQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

fn poisoned<T>(_: PoisonError<T>) -> QueueError {
    QueueError::Unavailable("delivery queue lock poisoned".to_string())
}

impl DeliveryQueue for InMemoryDeliveryQueue {
    fn enqueue(&self, job_id: JobId, payload: JsonValue) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(QueueError::Closed);
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        state.messages.insert(
            seq,
            Message {
                job_id,
                payload,
                deliveries: 0,
                lease_until: None,
            },
        );
        state.ready.push_back(seq);
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        let mut state = self.lock()?;

        loop {
            if state.closed {
                return Err(QueueError::Closed);
            }

            let now = Instant::now();
            state.reclaim_expired(now);

            while let Some(seq) = state.ready.pop_front() {
                let Some(message) = state.messages.get_mut(&seq) else {
                    continue;
                };
                message.deliveries += 1;
                message.lease_until = Some(now + self.config.visibility_timeout);

                return Ok(Some(Delivery {
                    job_id: message.job_id,
                    payload: message.payload.clone(),
                    attempt: message.deliveries,
                    handle: AckHandle::new(seq.to_string(), message.deliveries),
                }));
            }

            if now >= deadline {
                return Ok(None);
            }

            let wake_at = state
                .next_lease_expiry()
                .map_or(deadline, |expiry| expiry.min(deadline));
            let timeout = wake_at.saturating_duration_since(now);
            let (guard, _) = self
                .available
                .wait_timeout(state, timeout)
                .map_err(poisoned)?;
            state = guard;
        }
    }

    fn ack(&self, handle: AckHandle) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let (seq, _) = state.leased_message(&handle)?;
        state.messages.remove(&seq);
        Ok(())
    }

    fn nack(&self, handle: AckHandle) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let (seq, message) = state.leased_message(&handle)?;
        message.lease_until = None;
        state.ready.push_back(seq);
        drop(state);

        self.available.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use serde_json::json;

    use super::*;

    fn short_visibility(ms: u64) -> InMemoryDeliveryQueue {
        InMemoryDeliveryQueue::new(
            QueueConfig::default().with_visibility_timeout(Duration::from_millis(ms)),
        )
    }

    #[test]
    fn close_takes_effect_on_a_poisoned_queue() {
        let queue = Arc::new(InMemoryDeliveryQueue::default());
        let poisoner = queue.clone();
        let crashed: thread::Result<()> = thread::spawn(move || {
            let _guard = poisoner.state.lock().unwrap();
            panic!("consumer crashed while holding the lock");
        })
        .join();
        assert!(crashed.is_err());
        assert!(queue.state.is_poisoned());

        queue.close();

        let state = queue.state.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(state.closed);
    }

    #[test]
    fn receive_returns_enqueued_messages_in_order() {
        let queue = InMemoryDeliveryQueue::default();
        let first = JobId::new();
        let second = JobId::new();
        queue.enqueue(first, json!({"n": 1})).unwrap();
        queue.enqueue(second, json!({"n": 2})).unwrap();

        let a = queue.receive(Duration::ZERO).unwrap().unwrap();
        let b = queue.receive(Duration::ZERO).unwrap().unwrap();
        assert_eq!(a.job_id, first);
        assert_eq!(a.payload, json!({"n": 1}));
        assert_eq!(a.attempt, 1);
        assert_eq!(b.job_id, second);

        queue.ack(a.handle).unwrap();
        queue.ack(b.handle).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn receive_times_out_on_empty_queue() {
        let queue = InMemoryDeliveryQueue::default();
        let started = Instant::now();
        assert!(queue.receive(Duration::from_millis(20)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn leased_message_is_invisible_until_timeout_then_redelivered() {
        let queue = short_visibility(40);
        let job_id = JobId::new();
        queue.enqueue(job_id, json!({})).unwrap();

        let first = queue.receive(Duration::ZERO).unwrap().unwrap();
        assert!(queue.receive(Duration::ZERO).unwrap().is_none());
        assert_eq!(queue.in_flight(), 1);

        let second = queue
            .receive(Duration::from_millis(500))
            .unwrap()
            .expect("message should be redelivered after the visibility timeout");
        assert_eq!(second.job_id, job_id);
        assert_eq!(second.attempt, 2);
        assert!(second.is_redelivery());

        // The first handle went stale when the lease expired.
        assert!(matches!(
            queue.ack(first.handle),
            Err(QueueError::UnknownHandle(_))
        ));
        queue.ack(second.handle).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn nack_makes_message_visible_immediately() {
        let queue = InMemoryDeliveryQueue::default();
        queue.enqueue(JobId::new(), json!({})).unwrap();

        let first = queue.receive(Duration::ZERO).unwrap().unwrap();
        queue.nack(first.handle).unwrap();

        let again = queue.receive(Duration::ZERO).unwrap().unwrap();
        assert_eq!(again.attempt, 2);
        queue.ack(again.handle).unwrap();
    }

    #[test]
    fn handles_from_another_message_are_rejected() {
        let queue = InMemoryDeliveryQueue::default();
        let bogus = AckHandle::new("999", 1);
        assert!(matches!(queue.ack(bogus), Err(QueueError::UnknownHandle(_))));

        let garbage = AckHandle::new("not-a-seq", 1);
        assert!(matches!(queue.nack(garbage), Err(QueueError::UnknownHandle(_))));
    }

    #[test]
    fn blocked_consumer_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryDeliveryQueue::default());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.receive(Duration::from_secs(2)))
        };

        thread::sleep(Duration::from_millis(20));
        let job_id = JobId::new();
        queue.enqueue(job_id, json!({})).unwrap();

        let delivery = consumer.join().unwrap().unwrap().unwrap();
        assert_eq!(delivery.job_id, job_id);
        queue.ack(delivery.handle).unwrap();
    }

    #[test]
    fn close_ends_consume_iterator() {
        let queue = Arc::new(InMemoryDeliveryQueue::default());
        queue.enqueue(JobId::new(), json!({})).unwrap();

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut seen = 0;
                for delivery in queue.consume() {
                    let delivery = delivery.unwrap();
                    queue.ack(delivery.handle).unwrap();
                    seen += 1;
                }
                seen
            })
        };

        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(consumer.join().unwrap(), 1);
        assert_eq!(queue.enqueue(JobId::new(), json!({})), Err(QueueError::Closed));
    }

    #[test]
    fn competing_consumers_each_message_once_while_leased() {
        let queue = Arc::new(InMemoryDeliveryQueue::default());
        for _ in 0..20 {
            queue.enqueue(JobId::new(), json!({})).unwrap();
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut ids = Vec::new();
                    while let Some(delivery) = queue.receive(Duration::from_millis(20)).unwrap() {
                        ids.push(delivery.job_id);
                        queue.ack(delivery.handle).unwrap();
                    }
                    ids
                })
            })
            .collect();

        let mut all: Vec<JobId> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 20);
        assert_eq!(all.len(), 20);
    }
}
