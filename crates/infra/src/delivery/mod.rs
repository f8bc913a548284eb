//! At-least-once delivery of job references to worker consumers.
//!
//! The queue is decoupled from the job store: it only carries `(job_id, payload)`
//! pairs. A received delivery stays invisible to other consumers for the
//! visibility timeout; if it is neither acked nor nacked by then it becomes
//! visible again and is redelivered. Consumers must therefore be idempotent.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;
pub mod r#trait;

pub use in_memory::InMemoryDeliveryQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsDeliveryQueue;
pub use r#trait::{AckHandle, Deliveries, Delivery, DeliveryQueue, QueueError};
