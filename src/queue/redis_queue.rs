//! Redis-backed queue
//!
//! Each queue is a Redis Stream read through one consumer group, which gives:
//! - At-least-once delivery
//! - Parallel consumers across hosts
//! - Takeover of messages left unacknowledged by a silent consumer

use chrono::{DateTime, TimeZone, Utc};
use redis::{
    aio::MultiplexedConnection,
    streams::{StreamId, StreamPendingReply, StreamRangeReply, StreamReadOptions, StreamReadReply},
    AsyncCommands, Client, RedisResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{QueueError, QueueResult};
use crate::job::JobId;
use crate::queue::{
    ArchiveMessage, Delivery, MessageQueue, QueueKind, QueueStats, WorkerHeartbeat,
};

/// Default namespace for all keys
pub const DEFAULT_KEY_PREFIX: &str = "archive-bundler";

const FIELD_JOB_ID: &str = "job_id";
const FIELD_ARCHIVE_ID: &str = "archive_id";
const FIELD_ATTEMPT: &str = "attempt";

/// Configuration for Redis queues
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Redis connection URL
    pub url: String,
    /// Key prefix for namespacing
    pub key_prefix: String,
    /// Worker heartbeat interval
    pub heartbeat_interval: Duration,
    /// Worker heartbeat timeout (consider worker dead after this)
    pub heartbeat_timeout: Duration,
    /// Idle time after which another consumer may take over a message
    pub claim_timeout: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(60),
            claim_timeout: Duration::from_secs(1800),
        }
    }
}

impl RedisQueueConfig {
    /// Create config with custom Redis URL
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    fn heartbeat_prefix(&self) -> String {
        format!("{}:workers:heartbeat", self.key_prefix)
    }
}

/// Queue backed by a Redis Stream
pub struct RedisQueue {
    client: Client,
    connection: Arc<RwLock<MultiplexedConnection>>,
    config: RedisQueueConfig,
    kind: QueueKind,
    stream_key: String,
    stats_key: String,
    group: String,
}

impl RedisQueue {
    /// Connect and make sure the stream and its consumer group exist
    pub async fn new(config: RedisQueueConfig, kind: QueueKind) -> QueueResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| QueueError::ConnectionFailed {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                url: config.url.clone(),
                reason: e.to_string(),
            })?;

        let queue = Self {
            client,
            connection: Arc::new(RwLock::new(connection)),
            stream_key: format!("{}:{}:stream", config.key_prefix, kind.name()),
            stats_key: format!("{}:{}:stats", config.key_prefix, kind.name()),
            group: format!("{}-{}", config.key_prefix, kind.name()),
            config,
            kind,
        };

        queue.init_consumer_group().await?;
        Ok(queue)
    }

    /// Which queue this is
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    async fn init_consumer_group(&self) -> QueueResult<()> {
        let mut conn = self.connection.write().await;

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut *conn)
            .await;

        // BUSYGROUP means another process created it first
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::OperationFailed(e.to_string())),
        }
    }

    /// Get a fresh connection, used for blocking reads
    async fn get_conn(&self) -> QueueResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                url: self.config.url.clone(),
                reason: e.to_string(),
            })
    }

    /// Take over one message idle for longer than the claim timeout
    async fn claim_abandoned(&self, consumer: &str) -> QueueResult<Option<StreamId>> {
        let mut conn = self.connection.write().await;
        let claim_ms = self.config.claim_timeout.as_millis() as u64;

        let result: RedisResult<Vec<redis::Value>> = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(consumer)
            .arg(claim_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut *conn)
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) if e.to_string().contains("NOGROUP") => return Ok(None),
            Err(e) => return Err(QueueError::OperationFailed(e.to_string())),
        };

        let Some(entries) = reply.get(1) else {
            return Ok(None);
        };
        let claimed: StreamRangeReply = redis::from_redis_value(entries)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        match claimed.ids.into_iter().next() {
            Some(entry) => {
                conn.hincr::<_, _, _, i64>(&self.stats_key, "redelivered", 1)
                    .await?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Drop an entry that can never be handled
    async fn discard(&self, entry_id: &str) -> QueueResult<()> {
        let mut conn = self.connection.write().await;
        conn.xack::<_, _, _, i64>(&self.stream_key, &self.group, &[entry_id])
            .await?;
        conn.xdel::<_, _, i64>(&self.stream_key, &[entry_id]).await?;
        Ok(())
    }

    async fn to_delivery(&self, entry: StreamId, redelivered: bool) -> QueueResult<Option<Delivery>> {
        match decode_entry(&entry) {
            Some(message) => Ok(Some(Delivery {
                id: entry.id,
                message,
                redelivered,
            })),
            None => {
                warn!(queue = self.kind.name(), entry = %entry.id, "Discarding malformed message");
                self.discard(&entry.id).await?;
                Ok(None)
            }
        }
    }
}

fn decode_entry(entry: &StreamId) -> Option<ArchiveMessage> {
    let job_id: String = entry.get(FIELD_JOB_ID)?;
    let archive_id: u32 = entry.get(FIELD_ARCHIVE_ID)?;
    let attempt: u32 = entry.get(FIELD_ATTEMPT).unwrap_or(0);
    let job_id: JobId = job_id.parse().ok()?;
    Some(ArchiveMessage {
        job_id,
        archive_id,
        attempt,
    })
}

fn heartbeat_time(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[async_trait::async_trait]
impl MessageQueue for RedisQueue {
    fn name(&self) -> &str {
        self.kind.name()
    }

    async fn push(&self, message: &ArchiveMessage) -> QueueResult<()> {
        let mut conn = self.connection.write().await;

        redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(FIELD_JOB_ID)
            .arg(message.job_id.as_str())
            .arg(FIELD_ARCHIVE_ID)
            .arg(message.archive_id)
            .arg(FIELD_ATTEMPT)
            .arg(message.attempt)
            .query_async::<String>(&mut *conn)
            .await?;

        conn.hincr::<_, _, _, i64>(&self.stats_key, "total_submitted", 1)
            .await?;
        debug!(queue = self.kind.name(), %message, "Pushed");
        Ok(())
    }

    async fn pop(&self, consumer: &str, timeout: Duration) -> QueueResult<Option<Delivery>> {
        if let Some(entry) = self.claim_abandoned(consumer).await? {
            return self.to_delivery(entry, true).await;
        }

        // BLOCK holds the connection, so it must not be the shared one
        let mut conn = self.get_conn().await?;

        let opts = StreamReadOptions::default()
            .group(&self.group, consumer)
            .count(1)
            .block(timeout.as_millis() as usize);

        let result: StreamReadReply = conn
            .xread_options(&[&self.stream_key], &[">"], &opts)
            .await?;

        let entry = result
            .keys
            .into_iter()
            .next()
            .and_then(|stream| stream.ids.into_iter().next());

        match entry {
            Some(entry) => self.to_delivery(entry, false).await,
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.connection.write().await;

        let acked: i64 = conn
            .xack(&self.stream_key, &self.group, &[&delivery.id])
            .await?;
        conn.xdel::<_, _, i64>(&self.stream_key, &[&delivery.id])
            .await?;

        if acked > 0 {
            conn.hincr::<_, _, _, i64>(&self.stats_key, "completed", 1)
                .await?;
        }
        Ok(())
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.connection.write().await;

        let values: Vec<Option<i64>> = redis::cmd("HMGET")
            .arg(&self.stats_key)
            .arg("completed")
            .arg("total_submitted")
            .arg("redelivered")
            .query_async(&mut *conn)
            .await?;

        let length: u64 = conn.xlen(&self.stream_key).await?;
        let pending: StreamPendingReply = conn.xpending(&self.stream_key, &self.group).await?;
        let processing = pending.count() as u64;

        let counter = |i: usize| values.get(i).copied().flatten().unwrap_or(0).max(0) as u64;

        Ok(QueueStats {
            pending: length.saturating_sub(processing),
            processing,
            completed: counter(0),
            total_submitted: counter(1),
            redelivered: counter(2),
        })
    }

    async fn heartbeat(&self, worker_id: &str) -> QueueResult<()> {
        let mut conn = self.connection.write().await;
        let key = format!("{}:{}", self.config.heartbeat_prefix(), worker_id);
        let timeout_secs = self.config.heartbeat_timeout.as_secs();

        conn.set_ex::<_, _, ()>(&key, Utc::now().timestamp(), timeout_secs)
            .await?;
        Ok(())
    }

    async fn workers(&self) -> QueueResult<Vec<WorkerHeartbeat>> {
        let mut conn = self.connection.write().await;
        let prefix = self.config.heartbeat_prefix();

        let keys: Vec<String> = conn.keys(format!("{}:*", prefix)).await?;
        let mut workers = Vec::with_capacity(keys.len());

        for key in keys {
            // Key may have expired between KEYS and GET
            let seen: Option<i64> = conn.get(&key).await?;
            if let Some(seen) = seen {
                let worker_id = key
                    .strip_prefix(&prefix)
                    .map(|s| s.trim_start_matches(':'))
                    .unwrap_or(&key)
                    .to_string();
                workers.push(WorkerHeartbeat {
                    worker_id,
                    last_seen: heartbeat_time(seen),
                });
            }
        }

        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    async fn pending_count(&self) -> QueueResult<u64> {
        Ok(self.stats().await?.pending)
    }
}
