//! Redis Streams-backed delivery queue (durable, at-least-once).
//!
//! ## Layout
//!
//! - **Stream**: one entry per enqueued job, fields `job_id`, `payload`, `prior`
//! - **Consumer group**: shared by every worker; each entry goes to one consumer
//! - **Pending entries**: received but unacked; reclaimed with `XCLAIM` once idle
//!   for longer than the visibility timeout
//!
//! `nack` re-appends the entry (carrying its delivery count in `prior`) and
//! acks the original, so the message becomes visible again immediately.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};

use reporter_core::JobId;

use super::r#trait::{AckHandle, Delivery, DeliveryQueue, QueueError};
use crate::config::{QueueConfig, RedisConfig};

/// Pending entries inspected per reclaim pass.
const RECLAIM_BATCH: usize = 16;

#[derive(Debug, Clone)]
pub struct RedisStreamsDeliveryQueue {
    client: redis::Client,
    config: RedisConfig,
    queue: QueueConfig,
}

/// Parsed stream entry.
#[derive(Debug, Clone, PartialEq)]
struct StreamEntry {
    message_id: String,
    job_id: JobId,
    payload: JsonValue,
    /// Deliveries accumulated before the last `nack`
    prior: u32,
}

impl RedisStreamsDeliveryQueue {
    /// Open the client and make sure the consumer group exists.
    pub fn connect(config: RedisConfig, queue: QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url.as_str()).map_err(map_redis_error)?;
        let this = Self {
            client,
            config,
            queue,
        };
        this.ensure_consumer_group()?;
        Ok(this)
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// `XGROUP CREATE ... MKSTREAM`; an existing group is not an error.
    pub fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection(Duration::ZERO)?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error(e)),
        }
    }

    /// Open a connection whose reads may block for `extra` beyond the call timeout.
    fn connection(&self, extra: Duration) -> Result<redis::Connection, QueueError> {
        let timeout = self.config.call_timeout;
        let conn = self
            .client
            .get_connection_with_timeout(timeout)
            .map_err(map_redis_error)?;
        conn.set_read_timeout(Some(timeout + extra))
            .map_err(map_redis_error)?;
        conn.set_write_timeout(Some(timeout))
            .map_err(map_redis_error)?;
        Ok(conn)
    }

    fn append(
        &self,
        conn: &mut redis::Connection,
        job_id: JobId,
        payload: &str,
        prior: u32,
    ) -> Result<String, QueueError> {
        redis::cmd("XADD")
            .arg(&self.config.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(job_id.to_string())
            .arg("payload")
            .arg(payload)
            .arg("prior")
            .arg(prior)
            .query(conn)
            .map_err(map_redis_error)
    }

    /// `(consumer, delivery count)` for one pending entry.
    fn pending_entry(
        &self,
        conn: &mut redis::Connection,
        message_id: &str,
    ) -> Result<Option<(String, u32)>, QueueError> {
        let entries: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(message_id)
            .arg(message_id)
            .arg(1)
            .query(conn)
            .map_err(map_redis_error)?;

        Ok(entries
            .into_iter()
            .next()
            .map(|(_, consumer, _, count)| (consumer, count as u32)))
    }

    /// Claim the oldest pending entry idle past the visibility timeout.
    fn reclaim_expired(
        &self,
        conn: &mut redis::Connection,
    ) -> Result<Option<Delivery>, QueueError> {
        let min_idle_ms = self.queue.visibility_timeout.as_millis() as u64;

        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("-")
            .arg("+")
            .arg(RECLAIM_BATCH)
            .query(conn)
            .map_err(map_redis_error)?;

        for (message_id, previous_owner, idle_ms, _) in pending {
            if idle_ms < min_idle_ms {
                continue;
            }

            let claimed: redis::Value = redis::cmd("XCLAIM")
                .arg(&self.config.stream_key)
                .arg(&self.config.group)
                .arg(&self.config.consumer)
                .arg(min_idle_ms)
                .arg(&message_id)
                .query(conn)
                .map_err(map_redis_error)?;

            // Another consumer may have claimed it between XPENDING and XCLAIM.
            let Some(entry) = entries_of(claimed).into_iter().next() else {
                continue;
            };

            let entry = match parse_entry(entry) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(message_id = %message_id, error = %e, "dropping unparseable stream entry");
                    self.acknowledge(conn, &message_id)?;
                    continue;
                }
            };

            let count = self
                .pending_entry(conn, &message_id)?
                .map_or(1, |(_, count)| count);
            debug!(
                message_id = %message_id,
                job_id = %entry.job_id,
                previous_owner = %previous_owner,
                "visibility timeout expired; reclaimed"
            );
            return Ok(Some(into_delivery(entry, count)));
        }

        Ok(None)
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(1);
        // BLOCK 0 would wait forever.
        if !wait.is_zero() {
            cmd.arg("BLOCK").arg(wait.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&self.config.stream_key).arg(">");

        let reply: redis::Value = cmd.query(conn).map_err(map_redis_error)?;

        let Some(entry) = first_stream_entries(reply).into_iter().next() else {
            return Ok(None);
        };
        parse_entry(entry).map(|entry| Some(into_delivery(entry, 1)))
    }

    fn acknowledge(&self, conn: &mut redis::Connection, message_id: &str) -> Result<u64, QueueError> {
        redis::cmd("XACK")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(message_id)
            .query(conn)
            .map_err(map_redis_error)
    }

    fn read_entry(
        &self,
        conn: &mut redis::Connection,
        message_id: &str,
    ) -> Result<Option<StreamEntry>, QueueError> {
        let entries: redis::Value = redis::cmd("XRANGE")
            .arg(&self.config.stream_key)
            .arg(message_id)
            .arg(message_id)
            .query(conn)
            .map_err(map_redis_error)?;
        entries_of(entries).into_iter().next().map(parse_entry).transpose()
    }

    /// The handle must still be this consumer's current delivery of the entry.
    /// Returns the entry so `nack` can re-append it.
    fn check_owned(
        &self,
        conn: &mut redis::Connection,
        handle: &AckHandle,
    ) -> Result<StreamEntry, QueueError> {
        let stale = || QueueError::UnknownHandle(format!("{}#{}", handle.message_id(), handle.delivery()));
        let Some((owner, count)) = self.pending_entry(conn, handle.message_id())? else {
            return Err(stale());
        };
        let entry = self.read_entry(conn, handle.message_id())?.ok_or_else(stale)?;
        if is_current(handle, &owner, &self.config.consumer, entry.prior, count) {
            Ok(entry)
        } else {
            Err(stale())
        }
    }
}

/// Owned by `consumer` and not re-delivered since `handle` was issued.
fn is_current(handle: &AckHandle, owner: &str, consumer: &str, prior: u32, count: u32) -> bool {
    owner == consumer && prior + count == handle.delivery()
}

fn into_delivery(entry: StreamEntry, count: u32) -> Delivery {
    let attempt = entry.prior + count;
    Delivery {
        job_id: entry.job_id,
        payload: entry.payload,
        attempt,
        handle: AckHandle::new(entry.message_id, attempt),
    }
}

impl DeliveryQueue for RedisStreamsDeliveryQueue {
    #[instrument(skip(self, payload), fields(stream_key = %self.config.stream_key), err)]
    fn enqueue(&self, job_id: JobId, payload: JsonValue) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut conn = self.connection(Duration::ZERO)?;
        self.append(&mut conn, job_id, &payload, 0)?;
        Ok(())
    }

    fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection(wait)?;
        if let Some(delivery) = self.reclaim_expired(&mut conn)? {
            return Ok(Some(delivery));
        }
        self.read_new(&mut conn, wait)
    }

    fn ack(&self, handle: AckHandle) -> Result<(), QueueError> {
        let mut conn = self.connection(Duration::ZERO)?;
        self.check_owned(&mut conn, &handle)?;
        match self.acknowledge(&mut conn, handle.message_id())? {
            0 => Err(QueueError::UnknownHandle(handle.message_id().to_string())),
            _ => Ok(()),
        }
    }

    fn nack(&self, handle: AckHandle) -> Result<(), QueueError> {
        let mut conn = self.connection(Duration::ZERO)?;
        let entry = self.check_owned(&mut conn, &handle)?;

        let payload = serde_json::to_string(&entry.payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        // Re-append first: a crash between the two leaves a duplicate, never a loss.
        self.append(&mut conn, entry.job_id, &payload, handle.delivery())?;
        self.acknowledge(&mut conn, handle.message_id())?;
        Ok(())
    }
}

fn map_redis_error(e: redis::RedisError) -> QueueError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped() {
        QueueError::Unavailable(e.to_string())
    } else {
        QueueError::Backend(e.to_string())
    }
}

fn value_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Entries from an `XRANGE`/`XCLAIM` reply. Deleted entries come back as nil and are skipped.
fn entries_of(reply: redis::Value) -> Vec<redis::Value> {
    match reply {
        redis::Value::Bulk(entries) => entries
            .into_iter()
            .filter(|e| !matches!(e, redis::Value::Nil))
            .collect(),
        _ => Vec::new(),
    }
}

/// Entries of the first stream in an `XREADGROUP` reply (`[[key, [entry...]]]`); nil on timeout.
fn first_stream_entries(reply: redis::Value) -> Vec<redis::Value> {
    let redis::Value::Bulk(streams) = reply else {
        return Vec::new();
    };
    let Some(redis::Value::Bulk(stream)) = streams.into_iter().next() else {
        return Vec::new();
    };
    stream.into_iter().nth(1).map(entries_of).unwrap_or_default()
}

/// Parse `[message_id, [field, value, ...]]`.
fn parse_entry(entry: redis::Value) -> Result<StreamEntry, QueueError> {
    let malformed = |what: &str| QueueError::Serialization(format!("malformed stream entry: {what}"));

    let redis::Value::Bulk(parts) = entry else {
        return Err(malformed("not an array"));
    };
    let mut parts = parts.into_iter();
    let message_id = parts
        .next()
        .as_ref()
        .and_then(value_to_string)
        .ok_or_else(|| malformed("message id"))?;
    let Some(redis::Value::Bulk(raw_fields)) = parts.next() else {
        return Err(malformed("fields"));
    };

    let mut fields = HashMap::new();
    for pair in raw_fields.chunks(2) {
        if let [key, value] = pair {
            if let (Some(key), Some(value)) = (value_to_string(key), value_to_string(value)) {
                fields.insert(key, value);
            }
        }
    }

    let job_id = fields
        .get("job_id")
        .ok_or_else(|| malformed("missing job_id"))?
        .parse::<JobId>()
        .map_err(|e| QueueError::Serialization(e.to_string()))?;
    let payload = fields
        .get("payload")
        .map(|raw| serde_json::from_str(raw))
        .transpose()
        .map_err(|e| QueueError::Serialization(e.to_string()))?
        .unwrap_or(JsonValue::Null);
    let prior = fields
        .get("prior")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0);

    Ok(StreamEntry {
        message_id,
        job_id,
        payload,
        prior,
    })
}
