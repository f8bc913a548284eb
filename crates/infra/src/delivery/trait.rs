use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;

use reporter_core::JobId;

/// How long `consume()` blocks per receive before polling again.
const DEFAULT_CONSUME_POLL: Duration = Duration::from_millis(250);

/// Delivery queue operation error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Backend temporarily unreachable; the call may be retried.
    #[error("delivery queue unavailable: {0}")]
    Unavailable(String),

    /// Backend rejected the command.
    #[error("delivery queue backend error: {0}")]
    Backend(String),

    /// The handle no longer refers to an outstanding delivery (already settled,
    /// or its lease expired and the message was handed out again).
    #[error("unknown or stale delivery handle: {0}")]
    UnknownHandle(String),

    #[error("payload serialization error: {0}")]
    Serialization(String),

    /// The queue was shut down.
    #[error("delivery queue closed")]
    Closed,
}

impl QueueError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

/// Settlement token for one delivery.
///
/// Not `Clone`: `ack`/`nack` take it by value, so each delivery can be settled
/// at most once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a delivery must be acked or nacked"]
pub struct AckHandle {
    message_id: String,
    delivery: u32,
}

impl AckHandle {
    pub(crate) fn new(message_id: impl Into<String>, delivery: u32) -> Self {
        Self {
            message_id: message_id.into(),
            delivery,
        }
    }

    /// Backend message identifier.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Which delivery of the message this handle settles (1 = first).
    pub fn delivery(&self) -> u32 {
        self.delivery
    }
}

/// One delivery of a queued job reference.
#[derive(Debug)]
#[must_use = "a delivery must be acked or nacked"]
pub struct Delivery {
    pub job_id: JobId,
    pub payload: JsonValue,
    /// Delivery count for this message, starting at 1
    pub attempt: u32,
    pub handle: AckHandle,
}

impl Delivery {
    pub fn into_parts(self) -> (JobId, JsonValue, AckHandle) {
        (self.job_id, self.payload, self.handle)
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

/// At-least-once handoff from submission to worker consumers.
///
/// ## Delivery Guarantees
///
/// - `enqueue` either durably accepts the message or returns an error; it never
///   silently drops
/// - A received message is redelivered if not acked within the visibility timeout
/// - `nack` makes the message visible again immediately
///
/// ## Blocking
///
/// All methods block; `receive` waits at most `wait` for a message.
pub trait DeliveryQueue: Send + Sync {
    fn enqueue(&self, job_id: JobId, payload: JsonValue) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next visible message.
    fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Settle a delivery as processed.
    fn ack(&self, handle: AckHandle) -> Result<(), QueueError>;

    /// Give a delivery back for immediate redelivery.
    fn nack(&self, handle: AckHandle) -> Result<(), QueueError>;

    /// Blocking, non-restartable sequence of deliveries. Ends when the queue closes.
    fn consume(&self) -> Deliveries<'_, Self>
    where
        Self: Sized,
    {
        Deliveries::new(self, DEFAULT_CONSUME_POLL)
    }
}

impl<Q> DeliveryQueue for Arc<Q>
where
    Q: DeliveryQueue + ?Sized,
{
    fn enqueue(&self, job_id: JobId, payload: JsonValue) -> Result<(), QueueError> {
        (**self).enqueue(job_id, payload)
    }

    fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        (**self).receive(wait)
    }

    fn ack(&self, handle: AckHandle) -> Result<(), QueueError> {
        (**self).ack(handle)
    }

    fn nack(&self, handle: AckHandle) -> Result<(), QueueError> {
        (**self).nack(handle)
    }
}

/// Iterator returned by [`DeliveryQueue::consume`].
///
/// Each `next()` blocks until a message is visible. Backend errors are yielded
/// as items; a closed queue ends the sequence.
#[derive(Debug)]
pub struct Deliveries<'a, Q: ?Sized> {
    queue: &'a Q,
    poll: Duration,
    finished: bool,
}

impl<'a, Q: DeliveryQueue + ?Sized> Deliveries<'a, Q> {
    pub fn new(queue: &'a Q, poll: Duration) -> Self {
        Self {
            queue,
            poll,
            finished: false,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }
}

impl<Q: DeliveryQueue + ?Sized> Iterator for Deliveries<'_, Q> {
    type Item = Result<Delivery, QueueError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            match self.queue.receive(self.poll) {
                Ok(Some(delivery)) => return Some(Ok(delivery)),
                Ok(None) => continue,
                Err(QueueError::Closed) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
