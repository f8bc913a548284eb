//! Process configuration, read once from the environment in `main`.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use reporter_infra::config::{
    CoordinatorConfig, PostgresConfig, QueueConfig, RedisConfig, DEFAULT_VISIBILITY_TIMEOUT,
};
use reporter_infra::jobs::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    /// Postgres job store; in-memory when unset
    pub database_url: Option<String>,
    /// Redis Streams delivery queue; in-memory when unset
    pub redis_url: Option<String>,
    /// Consumer name within the Redis group; a unique name is generated when unset
    pub redis_consumer: Option<String>,
    pub visibility_timeout: Duration,
    pub enqueue_max_attempts: u32,
    /// Upper bound for each store/queue round trip
    pub call_timeout: Duration,
    /// Run a pass-through delivery worker inside the API process (dev only)
    pub embedded_worker: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            redis_url: None,
            redis_consumer: None,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            enqueue_max_attempts: RetryPolicy::default().max_attempts,
            call_timeout: Duration::from_secs(5),
            embedded_worker: false,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source; unset or blank variables keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            bind_addr: parse_or(get("BIND_ADDR"), "BIND_ADDR", defaults.bind_addr)?,
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            redis_consumer: get("REDIS_CONSUMER"),
            visibility_timeout: match parse_or(
                get("VISIBILITY_TIMEOUT_SECS"),
                "VISIBILITY_TIMEOUT_SECS",
                0u64,
            )? {
                0 => defaults.visibility_timeout,
                secs => Duration::from_secs(secs),
            },
            enqueue_max_attempts: parse_or(
                get("ENQUEUE_MAX_ATTEMPTS"),
                "ENQUEUE_MAX_ATTEMPTS",
                defaults.enqueue_max_attempts,
            )?,
            call_timeout: match parse_or(get("CALL_TIMEOUT_MS"), "CALL_TIMEOUT_MS", 0u64)? {
                0 => defaults.call_timeout,
                ms => Duration::from_millis(ms),
            },
            embedded_worker: parse_or(get("EMBEDDED_WORKER"), "EMBEDDED_WORKER", false)?,
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::default().with_visibility_timeout(self.visibility_timeout)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let defaults = RetryPolicy::default();
        CoordinatorConfig::default().with_retry(RetryPolicy::exponential(
            self.enqueue_max_attempts,
            defaults.base_delay,
            defaults.max_delay,
        ))
    }

    pub fn postgres_config(&self) -> Option<PostgresConfig> {
        self.database_url
            .as_ref()
            .map(|url| PostgresConfig::new(url.clone()).with_call_timeout(self.call_timeout))
    }

    pub fn redis_config(&self) -> Option<RedisConfig> {
        self.redis_url.as_ref().map(|url| {
            let config = RedisConfig::new(url.clone()).with_call_timeout(self.call_timeout);
            match &self.redis_consumer {
                Some(consumer) => config.with_consumer(consumer.clone()),
                None => config,
            }
        })
    }
}

fn parse_or<T>(raw: Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
