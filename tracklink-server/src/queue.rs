//! Downstream job queue.
//!
//! Location and alarm events leave the ingestion path as [`Job`]s. The queue
//! behind [`JobQueue`] belongs to the embedding process; [`ChannelQueue`] is
//! the bundled in-process implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue full ({capacity} jobs)")]
    Full { capacity: usize },

    #[error("queue closed")]
    Closed,

    #[error("enqueue timed out after {0:?}")]
    Timeout(Duration),
}

/// Kinds of downstream work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Location,
    Alarm,
}

impl JobKind {
    /// Scheduling priority; higher runs first.
    pub fn priority(&self) -> u8 {
        match self {
            JobKind::Location => 1,
            JobKind::Alarm => 10,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Location => "location",
            JobKind::Alarm => "alarm",
        }
    }
}

/// One unit of downstream work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub device_id: String,
    pub kind: JobKind,
    /// Decoded message payload as JSON.
    pub payload: Value,
    pub priority: u8,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(device_id: impl Into<String>, kind: JobKind, payload: Value, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            kind,
            payload,
            priority: kind.priority(),
            max_attempts,
            created_at: Utc::now(),
        }
    }
}

/// A sink for downstream jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues a job, waiting for capacity if the queue is bounded.
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;

    /// Enqueues a job without waiting.
    fn try_enqueue(&self, job: Job) -> Result<(), QueueError>;
}

/// Bounded in-process queue over a tokio mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<Job>,
    capacity: usize,
}

impl ChannelQueue {
    /// Creates a queue and the receiver the consumer drains.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, capacity }, rx)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        self.tx.send(job).await.map_err(|_| QueueError::Closed)
    }

    fn try_enqueue(&self, job: Job) -> Result<(), QueueError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}
