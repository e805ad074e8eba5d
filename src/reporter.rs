//! Activity records and the reporting channel
//!
//! Every non-trivial core operation emits an [`ActivityRecord`]. The
//! reporter buffers records on a bounded in-memory queue and a background
//! task forwards them to an external [`TicketSink`]. The queue favours
//! availability of the core over completeness of the audit trail: overflow
//! drops the oldest records and a single recovery record notes the loss.

use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Kind of event an activity record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Discovery,
    Load,
    CacheHit,
    CacheMiss,
    Invalidation,
    Selection,
    SelectionFallback,
    Modification,
    Error,
}

/// Structured audit entry delivered to the ticket sink
///
/// Sinks must be idempotent on `(timestamp, event_kind, agent_id,
/// source_path)`; delivery is at-least-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub timestamp: DateTime<Utc>,
    pub event_kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_generation: Option<u64>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl ActivityRecord {
    #[must_use]
    pub fn new(event_kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            event_kind,
            agent_id: None,
            source_path: None,
            view_generation: None,
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn agent(mut self, id: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn generation(mut self, generation: u64) -> Self {
        self.view_generation = Some(generation);
        self
    }

    #[must_use]
    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// External ticket sink the reporter forwards records to
///
/// Implementations may be slow or unreachable; the reporter never lets that
/// block the core. Errors are logged and dropped.
#[async_trait]
pub trait TicketSink: Send + Sync {
    async fn post_activity(&self, record: ActivityRecord) -> Result<()>;
}

struct ReporterShared {
    queue: parking_lot::Mutex<VecDeque<ActivityRecord>>,
    notify: Notify,
    cap: usize,
    dropped: AtomicU64,
    overflowed: AtomicBool,
    shutdown: AtomicBool,
}

/// Bounded, non-blocking activity channel with a background forwarder
pub struct ActivityReporter {
    shared: Arc<ReporterShared>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ActivityReporter {
    /// Start the reporter and its forwarding task
    #[must_use]
    pub fn start(sink: Arc<dyn TicketSink>, queue_cap: usize) -> Self {
        let shared = Arc::new(ReporterShared {
            queue: parking_lot::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cap: queue_cap.max(1),
            dropped: AtomicU64::new(0),
            overflowed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        let task = tokio::spawn(Self::pump(Arc::clone(&shared), sink));

        Self {
            shared,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Enqueue a record; never blocks
    ///
    /// On a full queue the oldest record is dropped; one `reporter_overflow`
    /// error record is forwarded when the queue recovers.
    pub fn emit(&self, record: ActivityRecord) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.cap {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                self.shared.overflowed.store(true, Ordering::Relaxed);
            }
            queue.push_back(record);
        }
        self.shared.notify.notify_one();
    }

    /// Records currently waiting for dispatch
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Signal shutdown and drain the queue, waiting at most `flush_deadline`
    pub async fn stop(&self, flush_deadline: Duration) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.notify.notify_one();

        let task = self.task.lock().take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(flush_deadline, task).await.is_err() {
                abort.abort();
                tracing::warn!("reporter flush deadline exceeded; remaining records dropped");
            }
        }
    }

    async fn pump(shared: Arc<ReporterShared>, sink: Arc<dyn TicketSink>) {
        loop {
            let batch: Vec<ActivityRecord> = {
                let mut queue = shared.queue.lock();
                queue.drain(..).collect()
            };

            if batch.is_empty() {
                if shared.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                shared.notify.notified().await;
                continue;
            }

            for record in batch {
                if let Err(e) = sink.post_activity(record).await {
                    tracing::warn!(error = %e, "ticket sink rejected activity record");
                }
            }

            if shared.overflowed.swap(false, Ordering::Relaxed) {
                let dropped = shared.dropped.swap(0, Ordering::Relaxed);
                let recovery = ActivityRecord::new(EventKind::Error).details(json!({
                    "kind": "reporter_overflow",
                    "dropped": dropped,
                }));
                if let Err(e) = sink.post_activity(recovery).await {
                    tracing::warn!(error = %e, "ticket sink rejected overflow record");
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(kind: EventKind) -> ActivityRecord {
        ActivityRecord::new(kind).agent("qa").details(json!({"n": 1}))
    }

    #[tokio::test]
    async fn records_reach_the_sink_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = ActivityReporter::start(Arc::clone(&sink) as Arc<dyn TicketSink>, 100);

        reporter.emit(record(EventKind::Discovery));
        reporter.emit(record(EventKind::CacheMiss));
        reporter.emit(record(EventKind::Load));
        reporter.stop(Duration::from_secs(1)).await;

        assert_eq!(
            sink.kinds(),
            vec![EventKind::Discovery, EventKind::CacheMiss, EventKind::Load]
        );
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_reports_once() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = ActivityReporter::start(Arc::clone(&sink) as Arc<dyn TicketSink>, 2);

        // Emit a burst larger than the queue without yielding to the pump.
        for i in 0..5 {
            reporter.emit(
                ActivityRecord::new(EventKind::Modification).details(json!({ "seq": i })),
            );
        }
        reporter.stop(Duration::from_secs(1)).await;

        let records = sink.records.lock();
        let overflow: Vec<_> = records
            .iter()
            .filter(|r| r.details.get("kind").and_then(|v| v.as_str()) == Some("reporter_overflow"))
            .collect();
        assert_eq!(overflow.len(), 1);
        assert_eq!(overflow[0].details["dropped"], json!(3));

        // The newest records survived.
        let seqs: Vec<_> = records
            .iter()
            .filter_map(|r| r.details.get("seq").and_then(serde_json::Value::as_u64))
            .collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn emit_is_nonblocking_with_a_dead_sink() {
        struct StuckSink;

        #[async_trait]
        impl TicketSink for StuckSink {
            async fn post_activity(&self, _record: ActivityRecord) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let reporter = ActivityReporter::start(Arc::new(StuckSink), 4);
        for _ in 0..100 {
            reporter.emit(record(EventKind::Error));
        }
        assert!(reporter.queue_depth() <= 4);
        reporter.stop(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = ActivityReporter::start(Arc::clone(&sink) as Arc<dyn TicketSink>, 10);
        reporter.stop(Duration::from_secs(1)).await;
        reporter.stop(Duration::from_secs(1)).await;
    }
}
