//! Work queues
//!
//! Two point-to-point queues carry the same message shape,
//! `{job_id, archive_id}`: the dispatch queue feeds archive workers and the
//! completion queue feeds the aggregator. Delivery is at-least-once; a
//! message stays owned by its consumer until acknowledged.

mod memory;
mod redis_queue;

pub use memory::MemoryQueue;
pub use redis_queue::{RedisQueue, RedisQueueConfig, DEFAULT_KEY_PREFIX};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::QueueResult;
use crate::job::{Archive, JobId};

/// Message naming one archive of one job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchiveMessage {
    pub job_id: JobId,
    pub archive_id: u32,
    /// Build attempt of the archive when the message was sent
    #[serde(default)]
    pub attempt: u32,
}

impl ArchiveMessage {
    /// Create a message for the first build attempt
    pub fn new(job_id: JobId, archive_id: u32) -> Self {
        Self {
            job_id,
            archive_id,
            attempt: 0,
        }
    }

    /// Create a message for the archive's current build attempt
    pub fn for_archive(archive: &Archive) -> Self {
        Self {
            job_id: archive.job_id.clone(),
            archive_id: archive.archive_id,
            attempt: archive.attempt,
        }
    }

    /// Whether the archive has been reset since this message was sent
    pub fn is_superseded_by(&self, archive: &Archive) -> bool {
        self.attempt < archive.attempt
    }
}

impl fmt::Display for ArchiveMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_id, self.archive_id)?;
        if self.attempt > 0 {
            write!(f, "#{}", self.attempt)?;
        }
        Ok(())
    }
}

/// A message handed to a consumer, to be acknowledged once handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue-assigned delivery id
    pub id: String,
    /// The message
    pub message: ArchiveMessage,
    /// Whether the message was taken over from another consumer
    pub redelivered: bool,
}

/// Which of the two queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Archive build requests
    Dispatch,
    /// Archive completion notifications
    Completion,
}

impl QueueKind {
    /// Short name used in keys and logs
    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::Dispatch => "dispatch",
            QueueKind::Completion => "completion",
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Messages waiting for a consumer
    pub pending: u64,
    /// Messages handed out but not yet acknowledged
    pub processing: u64,
    /// Messages acknowledged
    pub completed: u64,
    /// Messages ever pushed
    pub total_submitted: u64,
    /// Messages taken over from a silent consumer
    pub redelivered: u64,
}

/// Last heartbeat of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub last_seen: DateTime<Utc>,
}

/// A durable point-to-point message queue
#[async_trait::async_trait]
pub trait MessageQueue: Send + Sync {
    /// Queue name for logs
    fn name(&self) -> &str;

    /// Enqueue a message
    async fn push(&self, message: &ArchiveMessage) -> QueueResult<()>;

    /// Take the next message, waiting up to `timeout`
    async fn pop(&self, consumer: &str, timeout: Duration) -> QueueResult<Option<Delivery>>;

    /// Acknowledge a handled delivery
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Get queue statistics
    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Record that a worker is alive
    async fn heartbeat(&self, worker_id: &str) -> QueueResult<()>;

    /// Workers with a live heartbeat
    async fn workers(&self) -> QueueResult<Vec<WorkerHeartbeat>>;

    /// Number of messages waiting for a consumer
    async fn pending_count(&self) -> QueueResult<u64>;

    /// Check if no message is waiting
    async fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.pending_count().await? == 0)
    }
}
