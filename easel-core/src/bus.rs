//! Progress bus: in-process broadcast of job state changes and progress
//! frames.
//!
//! Delivery is best-effort with a bounded buffer per subscriber.  A slow
//! subscriber drops its own oldest undelivered events; other subscribers
//! are unaffected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::{Job, ProgressFrame};

/// Default per-subscriber buffer capacity.
const DEFAULT_CAPACITY: usize = 256;

/// Events observable on the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A job changed status (emitted by the queue store on every
    /// transition, in transition order per job).
    JobChanged { job: Job },
    /// A monitor observed generation progress.
    JobProgress {
        #[serde(flatten)]
        frame: ProgressFrame,
    },
}

impl QueueEvent {
    /// The id of the job this event concerns.
    pub fn job_id(&self) -> &str {
        match self {
            QueueEvent::JobChanged { job } => &job.id,
            QueueEvent::JobProgress { frame } => &frame.job_id,
        }
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    total_published: AtomicU64,
    dropped_events: AtomicU64,
}

/// Broadcast-based bus handle.  Cheap to clone; all clones share the
/// channel and statistics.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
    stats: Arc<StatsInner>,
}

impl EventBus {
    /// Create a bus with the default per-subscriber capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with the given per-subscriber capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// With no subscribers attached the event is dropped and counted in
    /// [`BusStats::dropped_events`].
    pub fn publish(&self, event: QueueEvent) {
        self.stats.total_published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(event).is_err() {
            self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Attach a new subscriber receiving events published from now on.
    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            rx: self.tx.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Snapshot of publish/drop counters.
    pub fn stats(&self) -> BusStats {
        BusStats {
            total_published: self.stats.total_published.load(Ordering::Relaxed),
            dropped_events: self.stats.dropped_events.load(Ordering::Relaxed),
            active_subscribers: self.tx.receiver_count(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A receiving handle onto the bus.
pub struct BusSubscription {
    rx: broadcast::Receiver<QueueEvent>,
    stats: Arc<StatsInner>,
}

impl BusSubscription {
    /// Receive the next event, waiting asynchronously.
    ///
    /// Lag is absorbed here: when this subscriber's buffer overflowed, the
    /// dropped count is recorded and the next available event is returned.
    /// Returns `None` only when the bus itself is gone.
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.dropped_events.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<QueueEvent> {
        match self.rx.try_recv() {
            Ok(ev) => Some(ev),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                self.stats.dropped_events.fetch_add(n, Ordering::Relaxed);
                self.rx.try_recv().ok()
            }
            Err(_) => None,
        }
    }
}

/// Snapshot of bus statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStats {
    pub total_published: u64,
    pub dropped_events: u64,
    pub active_subscribers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AppType, JobResult, JobStatus};
    use chrono::Utc;

    fn frame(job_id: &str, percent: f64) -> QueueEvent {
        QueueEvent::JobProgress {
            frame: ProgressFrame {
                job_id: job_id.to_owned(),
                percent,
                preview_filename: None,
                current_step: 1,
                total_steps: 20,
                timestamp: Utc::now(),
            },
        }
    }

    fn job(id: &str) -> Job {
        Job {
            id: id.to_owned(),
            status: JobStatus::Pending,
            target_backend: "a".to_owned(),
            backend_session: None,
            app_type: AppType::Forge,
            source_info: None,
            api_key_ref: None,
            generation_params: serde_json::json!({}),
            result: JobResult::default(),
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(frame("j1", 10.0));

        assert_eq!(a.recv().await.unwrap().job_id(), "j1");
        assert_eq!(b.recv().await.unwrap().job_id(), "j1");
        assert_eq!(bus.stats().total_published, 1);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_for_slow_subscriber_only() {
        let bus = EventBus::with_capacity(2);
        let mut slow = bus.subscribe();

        for i in 0..5 {
            bus.publish(frame(&format!("j{i}"), i as f64));
        }

        // Oldest three were dropped for this subscriber; the last two
        // survive in publish order.
        assert_eq!(slow.recv().await.unwrap().job_id(), "j3");
        assert_eq!(slow.recv().await.unwrap().job_id(), "j4");
        assert!(bus.stats().dropped_events >= 3);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_counted_not_fatal() {
        let bus = EventBus::new();
        bus.publish(QueueEvent::JobChanged { job: job("j1") });
        assert_eq!(bus.stats().dropped_events, 1);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = frame("j1", 42.0);
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "job_progress");
        assert_eq!(v["job_id"], "j1");
        assert_eq!(v["percent"], 42.0);

        let ev = QueueEvent::JobChanged { job: job("j2") };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "job_changed");
        assert_eq!(v["job"]["job_id"], "j2");
        assert_eq!(v["job"]["status"], "pending");
    }
}
