//! In-process log fan-out.
//!
//! The store is the source of truth for job output; this bus only feeds
//! live subscribers (WebSocket sessions, log polls). Delivery is
//! best-effort and never blocks a publisher: a slow subscriber drops
//! chunks and re-syncs from the store with a `since` cursor.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use zephyr_core::events::JobEvent;
use zephyr_core::ids::JobId;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
pub struct LogBus {
    channels: Mutex<HashMap<JobId, broadcast::Sender<JobEvent>>>,
}

impl LogBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a job's live feed.
    pub fn subscribe(&self, job_id: JobId) -> broadcast::Receiver<JobEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fan an event out to current subscribers, if any.
    pub fn publish(&self, job_id: JobId, event: JobEvent) {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = channels.get(&job_id) {
            // Err means no live receivers; durable history covers them.
            let _ = sender.send(event);
        }
    }

    /// Drop the channel once a job is terminal and its tail is durable.
    pub fn retire(&self, job_id: JobId) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.remove(&job_id);
    }

    pub fn active_channels(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zephyr_core::events::{JobStatusChange, OutputChunk};
    use zephyr_core::run::{LogStream, Status};

    fn output(job_id: JobId, seq: i64, content: &str) -> JobEvent {
        JobEvent::Output(OutputChunk {
            job_id,
            step_id: None,
            stream: LogStream::Stdout,
            content: content.to_string(),
            seq,
            timestamp: chrono::Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = LogBus::new();
        let job_id = JobId::new();
        let mut rx = bus.subscribe(job_id);

        bus.publish(job_id, output(job_id, 1, "first"));
        bus.publish(job_id, output(job_id, 2, "second"));

        match rx.recv().await.unwrap() {
            JobEvent::Output(chunk) => assert_eq!(chunk.seq, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            JobEvent::Output(chunk) => assert_eq!(chunk.seq, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = LogBus::new();
        let job_id = JobId::new();
        bus.publish(job_id, output(job_id, 1, "dropped"));
        assert_eq!(bus.active_channels(), 0);
    }

    #[tokio::test]
    async fn test_retire_closes_channel() {
        let bus = LogBus::new();
        let job_id = JobId::new();
        let mut rx = bus.subscribe(job_id);

        bus.publish(
            job_id,
            JobEvent::StatusChanged(JobStatusChange {
                run_id: zephyr_core::ids::RunId::new(),
                job_id,
                status: Status::Success,
                exit_code: Some(0),
                timestamp: chrono::Utc::now(),
            }),
        );
        bus.retire(job_id);

        assert!(matches!(rx.recv().await, Ok(JobEvent::StatusChanged(_))));
        assert!(rx.recv().await.is_err());
        assert_eq!(bus.active_channels(), 0);
    }
}
