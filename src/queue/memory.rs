//! In-process queue with the same at-least-once contract as the Redis queue

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{QueueError, QueueResult};
use crate::queue::{ArchiveMessage, Delivery, MessageQueue, QueueStats, WorkerHeartbeat};

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<(String, ArchiveMessage, bool)>,
    in_flight: HashMap<String, ArchiveMessage>,
    heartbeats: HashMap<String, chrono::DateTime<Utc>>,
    next_id: u64,
    stats: QueueStats,
    closed: bool,
}

/// Queue held in memory, shared by tasks of one process
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    /// Create an empty queue
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Return every unacknowledged delivery to the front of the queue, as if
    /// its consumer had crashed. Returns the number of messages requeued.
    pub fn redeliver_in_flight(&self) -> usize {
        let mut state = self.state.lock();
        let mut in_flight: Vec<(String, ArchiveMessage)> = state.in_flight.drain().collect();
        in_flight.sort_by(|a, b| b.0.cmp(&a.0));

        let count = in_flight.len();
        for (id, message) in in_flight {
            state.ready.push_front((id, message, true));
        }
        state.stats.processing = 0;
        state.stats.pending += count as u64;
        state.stats.redelivered += count as u64;
        drop(state);

        for _ in 0..count {
            self.notify.notify_one();
        }
        count
    }

    /// Messages handed out but not acknowledged
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Copy of every waiting message, in delivery order
    pub fn snapshot(&self) -> Vec<ArchiveMessage> {
        self.state
            .lock()
            .ready
            .iter()
            .map(|(_, m, _)| m.clone())
            .collect()
    }

    /// Stop accepting messages and wake all waiting consumers
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn try_take(&self) -> QueueResult<Option<Delivery>> {
        let mut state = self.state.lock();
        match state.ready.pop_front() {
            Some((id, message, redelivered)) => {
                state.in_flight.insert(id.clone(), message.clone());
                state.stats.pending = state.stats.pending.saturating_sub(1);
                state.stats.processing += 1;
                Ok(Some(Delivery {
                    id,
                    message,
                    redelivered,
                }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl MessageQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, message: &ArchiveMessage) -> QueueResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed {
                    name: self.name.clone(),
                });
            }
            state.next_id += 1;
            let id = format!("{}-{}", self.name, state.next_id);
            state.ready.push_back((id, message.clone(), false));
            state.stats.pending += 1;
            state.stats.total_submitted += 1;
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, _consumer: &str, timeout: Duration) -> QueueResult<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_take()? {
                return Ok(Some(delivery));
            }
            if self.state.lock().closed {
                return Ok(None);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_take();
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.state.lock();
        if state.in_flight.remove(&delivery.id).is_some() {
            state.stats.processing = state.stats.processing.saturating_sub(1);
            state.stats.completed += 1;
        }
        Ok(())
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(self.state.lock().stats.clone())
    }

    async fn heartbeat(&self, worker_id: &str) -> QueueResult<()> {
        self.state
            .lock()
            .heartbeats
            .insert(worker_id.to_string(), Utc::now());
        Ok(())
    }

    async fn workers(&self) -> QueueResult<Vec<WorkerHeartbeat>> {
        let mut workers: Vec<WorkerHeartbeat> = self
            .state
            .lock()
            .heartbeats
            .iter()
            .map(|(id, seen)| WorkerHeartbeat {
                worker_id: id.clone(),
                last_seen: *seen,
            })
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    async fn pending_count(&self) -> QueueResult<u64> {
        Ok(self.state.lock().ready.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use std::sync::Arc;

    fn message(archive_id: u32) -> ArchiveMessage {
        ArchiveMessage::new(JobId::generate(), archive_id)
    }

    #[tokio::test]
    async fn test_fifo_and_ack() {
        let queue = MemoryQueue::new("test");
        queue.push(&message(0)).await.unwrap();
        queue.push(&message(1)).await.unwrap();

        let first = queue.pop("c", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.message.archive_id, 0);
        assert!(!first.redelivered);
        assert_eq!(queue.pending_count().await.unwrap(), 1);

        queue.ack(&first).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.total_submitted, 2);
    }

    #[tokio::test]
    async fn test_pop_times_out_when_empty() {
        let queue = MemoryQueue::new("test");
        let got = queue.pop("c", Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(MemoryQueue::new("test"));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop("c", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(&message(7)).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.message.archive_id, 7);
    }

    #[tokio::test]
    async fn test_unacked_messages_are_redelivered() {
        let queue = MemoryQueue::new("test");
        queue.push(&message(0)).await.unwrap();
        let delivery = queue.pop("c", Duration::from_millis(10)).await.unwrap().unwrap();

        assert_eq!(queue.redeliver_in_flight(), 1);
        let again = queue.pop("c", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.message, delivery.message);
        assert!(again.redelivered);
        assert_eq!(queue.stats().await.unwrap().redelivered, 1);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_push() {
        let queue = MemoryQueue::new("test");
        queue.close();
        assert!(matches!(
            queue.push(&message(0)).await,
            Err(QueueError::Closed { .. })
        ));
        assert!(queue.pop("c", Duration::from_secs(5)).await.unwrap().is_none());
    }
}
