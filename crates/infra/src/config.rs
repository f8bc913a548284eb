//! Configuration structs for the job lifecycle components.
//!
//! Every component receives its configuration by value at construction time.
//! Nothing here is read from the environment or cached process-wide; the
//! binary that wires the components decides where values come from.

use std::time::Duration;

use crate::jobs::RetryPolicy;

/// Default interval after which an unacknowledged delivery is redelivered.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of jobs returned by a listing.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Delivery queue behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// How long a received delivery stays invisible to other consumers
    pub visibility_timeout: Duration,
    /// How long a consumer blocks per receive before re-checking for shutdown
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl QueueConfig {
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Coordinator behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Backoff applied to transient enqueue and status-write failures
    pub retry: RetryPolicy,
    /// Upper bound on a single listing
    pub max_list_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_list_limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_list_limit(mut self, limit: usize) -> Self {
        self.max_list_limit = limit.max(1);
        self
    }
}

/// Postgres job store connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    /// Upper bound for every database round trip
    pub call_timeout: Duration,
}

impl PostgresConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            call_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Redis Streams delivery queue settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RedisConfig {
    pub url: String,
    /// Stream key holding pending deliveries
    pub stream_key: String,
    /// Consumer group shared by all workers
    pub group: String,
    /// Name of this consumer within the group; unique per process by default
    pub consumer: String,
    /// Upper bound for every Redis round trip
    pub call_timeout: Duration,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_key: "reporter:jobs".to_string(),
            group: "reporter.workers".to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            call_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_stream_key(mut self, key: impl Into<String>) -> Self {
        self.stream_key = key.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}
