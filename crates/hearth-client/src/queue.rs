//! Debounced mutation queue.
//!
//! Store writes enqueue a [`Mutation`] and return at once. A worker drains
//! the queue after a quiet period with no new enqueues (each enqueue resets
//! the timer), or immediately on [`MutationQueue::flush`]. A drain snapshots
//! and clears the queue under a lock, then applies each mutation in FIFO order
//! outside it. Drains never overlap.
//!
//! One failing mutation does not stop the rest. Persistence failures go back
//! to the front of the queue and wait for the next trigger; other failures are
//! logged and dropped.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use hearth_types::{Mutation, MutationError, ScopeKey};

#[derive(Debug, Error)]
pub enum SinkError {
    /// The write could not be persisted; it will be retried.
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("agent unavailable: {0}")]
    Agent(String),
    #[error(transparent)]
    Malformed(#[from] MutationError),
}

/// Where drained mutations are applied.
#[async_trait]
pub trait MutationSink: Send + Sync + 'static {
    /// Apply one mutation. Returns whether it changed anything.
    async fn apply(&self, mutation: &Mutation) -> Result<bool, SinkError>;

    /// Called once at the end of every drain.
    async fn drained(&self, _report: &DrainReport) {}
}

/// What one drain did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub applied: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub requeued: usize,
    /// Collections changed by network-bound mutations, per `(scope, document)`.
    pub touched: BTreeMap<(ScopeKey, String), BTreeSet<String>>,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.applied + self.unchanged + self.failed == 0
    }

    fn touch(&mut self, mutation: &Mutation) {
        let path = mutation.path();
        if let Some(collection) = path.collection_name() {
            self.touched
                .entry((path.scope().clone(), path.document_name().to_string()))
                .or_default()
                .insert(collection.to_string());
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub draining: usize,
    pub drains: u64,
}

struct QueueInner {
    sink: Arc<dyn MutationSink>,
    debounce: Duration,
    queued: Mutex<VecDeque<Mutation>>,
    /// Snapshot taken by the running drain, minus what it has applied.
    draining: Mutex<VecDeque<Mutation>>,
    drains: Mutex<u64>,
    drain_lock: tokio::sync::Mutex<()>,
    wake: Notify,
}

pub struct MutationQueue {
    inner: Arc<QueueInner>,
    cancel: CancellationToken,
}

impl MutationQueue {
    /// Create the queue and start its worker on the current runtime.
    pub fn new(sink: Arc<dyn MutationSink>, debounce: Duration) -> Self {
        let inner = Arc::new(QueueInner {
            sink,
            debounce,
            queued: Mutex::new(VecDeque::new()),
            draining: Mutex::new(VecDeque::new()),
            drains: Mutex::new(0),
            drain_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
        });
        let cancel = CancellationToken::new();
        tokio::spawn(worker(inner.clone(), cancel.clone()));
        Self { inner, cancel }
    }

    /// Append a mutation and restart the debounce timer.
    pub fn enqueue(&self, mutation: Mutation) {
        self.inner.queued.lock().push_back(mutation);
        self.inner.wake.notify_one();
    }

    /// Drain now, waiting for any drain already running to finish first.
    pub async fn flush(&self) -> DrainReport {
        self.inner.drain().await
    }

    pub fn len(&self) -> usize {
        self.inner.queued.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a mutation touching this collection is queued or mid-drain.
    pub fn has_pending(&self, scope: &ScopeKey, document: &str, collection: &str) -> bool {
        let touches = |m: &Mutation| {
            let path = m.path();
            path.scope() == scope
                && path.document_name() == document
                && path.collection_name().is_none_or(|c| c == collection)
        };
        self.inner.queued.lock().iter().any(touches)
            || self.inner.draining.lock().iter().any(touches)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.inner.queued.lock().len(),
            draining: self.inner.draining.lock().len(),
            drains: *self.inner.drains.lock(),
        }
    }

    /// Stop the worker. Queued mutations stay until the next `flush`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MutationQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl QueueInner {
    async fn drain(&self) -> DrainReport {
        let _serial = self.drain_lock.lock().await;

        let batch: VecDeque<Mutation> = std::mem::take(&mut *self.queued.lock());
        let mut report = DrainReport::default();
        if batch.is_empty() {
            return report;
        }
        *self.draining.lock() = batch.clone();
        *self.drains.lock() += 1;

        let mut retry = Vec::new();
        for mutation in batch {
            match self.sink.apply(&mutation).await {
                Ok(true) => {
                    report.applied += 1;
                    if mutation.requires_network() {
                        report.touch(&mutation);
                    }
                }
                Ok(false) => report.unchanged += 1,
                Err(SinkError::Persistence(reason)) => {
                    tracing::warn!(
                        path = %mutation.path(),
                        %reason,
                        "mutation not persisted, requeueing"
                    );
                    report.failed += 1;
                    retry.push(mutation);
                }
                Err(e) => {
                    tracing::warn!(path = %mutation.path(), error = %e, "mutation dropped");
                    report.failed += 1;
                }
            }
            self.draining.lock().pop_front();
        }

        if !retry.is_empty() {
            report.requeued = retry.len();
            let mut queued = self.queued.lock();
            for mutation in retry.into_iter().rev() {
                queued.push_front(mutation);
            }
        }

        tracing::debug!(
            applied = report.applied,
            unchanged = report.unchanged,
            failed = report.failed,
            "queue drained"
        );
        self.sink.drained(&report).await;
        report
    }
}

async fn worker(inner: Arc<QueueInner>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = inner.wake.notified() => {}
        }
        // Quiet period: every enqueue restarts it.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(inner.debounce) => break,
                _ = inner.wake.notified() => continue,
            }
        }
        inner.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_types::DocPath;
    use serde_json::{Value, json};

    #[derive(Default)]
    struct RecordingSink {
        applied: Mutex<Vec<Mutation>>,
        fail_persist_once: Mutex<Option<String>>,
        reject: Mutex<Option<String>>,
    }

    #[async_trait]
    impl MutationSink for RecordingSink {
        async fn apply(&self, mutation: &Mutation) -> Result<bool, SinkError> {
            let prop = mutation.path().property_name().unwrap_or_default().to_string();
            if self.reject.lock().as_deref() == Some(prop.as_str()) {
                return Err(SinkError::Agent("closed".into()));
            }
            let mut once = self.fail_persist_once.lock();
            if once.as_deref() == Some(prop.as_str()) {
                *once = None;
                return Err(SinkError::Persistence("disk full".into()));
            }
            self.applied.lock().push(mutation.clone());
            Ok(true)
        }
    }

    fn put(prop: &str, value: Value) -> Mutation {
        Mutation::put(
            DocPath::property(ScopeKey::app_public(), "home", "settings", prop).unwrap(),
            value,
        )
    }

    fn props(sink: &RecordingSink) -> Vec<String> {
        sink.applied
            .lock()
            .iter()
            .map(|m| m.path().property_name().unwrap().to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_into_one_drain_in_fifo_order() {
        let sink = Arc::new(RecordingSink::default());
        let queue = MutationQueue::new(sink.clone(), Duration::from_millis(75));

        for (i, p) in ["a", "b", "c"].iter().enumerate() {
            queue.enqueue(put(p, json!(i)));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // 50ms since the last enqueue: still inside the quiet period.
        assert!(sink.applied.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(props(&sink), vec!["a", "b", "c"]);
        assert_eq!(queue.stats().drains, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_drains_immediately() {
        let sink = Arc::new(RecordingSink::default());
        let queue = MutationQueue::new(sink.clone(), Duration::from_secs(60));
        queue.enqueue(put("a", json!(1)));
        queue.enqueue(put("b", json!(2)));

        let report = queue.flush().await;
        assert_eq!(report.applied, 2);
        assert_eq!(
            report.touched[&(ScopeKey::app_public(), "home".to_string())],
            BTreeSet::from(["settings".to_string()])
        );
        assert_eq!(props(&sink), vec!["a", "b"]);

        assert!(queue.flush().await.is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_persistence_is_retried() {
        let sink = Arc::new(RecordingSink::default());
        *sink.fail_persist_once.lock() = Some("b".into());
        *sink.reject.lock() = Some("c".into());
        let queue = MutationQueue::new(sink.clone(), Duration::from_secs(60));
        for p in ["a", "b", "c", "d"] {
            queue.enqueue(put(p, json!(p)));
        }

        let report = queue.flush().await;
        assert_eq!(report.applied, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.requeued, 1);
        assert_eq!(props(&sink), vec!["a", "d"]);
        assert!(queue.has_pending(&ScopeKey::app_public(), "home", "settings"));

        queue.enqueue(put("e", json!("e")));
        queue.flush().await;
        assert_eq!(props(&sink), vec!["a", "d", "b", "e"]);
        assert!(!queue.has_pending(&ScopeKey::app_public(), "home", "settings"));
    }

    #[tokio::test]
    async fn test_document_level_mutation_is_not_touched() {
        let sink = Arc::new(RecordingSink::default());
        let queue = MutationQueue::new(sink.clone(), Duration::from_secs(60));
        queue.enqueue(Mutation::delete(
            DocPath::document(ScopeKey::app_public(), "home").unwrap(),
        ));
        let report = queue.flush().await;
        assert_eq!(report.applied, 1);
        assert!(report.touched.is_empty());
    }
}
