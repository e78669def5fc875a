//! Per-scope readiness gate.
//!
//! A scope opens when its first `data-update` arrives (or the cache already
//! holds it). Callers that ask for a store earlier park on a oneshot and are
//! released exactly once.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use hearth_types::ScopeKey;

#[derive(Default)]
struct GateInner {
    open: HashSet<ScopeKey>,
    waiters: HashMap<ScopeKey, Vec<oneshot::Sender<()>>>,
}

#[derive(Default)]
pub struct StoreGate {
    inner: Mutex<GateInner>,
}

impl StoreGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, scope: &ScopeKey) -> bool {
        self.inner.lock().open.contains(scope)
    }

    /// Open the scope and wake its waiters. Returns how many were woken.
    pub fn release(&self, scope: &ScopeKey) -> usize {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.open.insert(scope.clone());
            inner.waiters.remove(scope).unwrap_or_default()
        };
        waiters
            .into_iter()
            .filter_map(|tx| tx.send(()).ok())
            .count()
    }

    /// Close the scope again, e.g. after logout.
    pub fn reset(&self, scope: &ScopeKey) {
        self.inner.lock().open.remove(scope);
    }

    /// Wait for the scope to open. Returns `false` on timeout.
    pub async fn wait_open(&self, scope: &ScopeKey, timeout: Duration) -> bool {
        let rx = {
            let mut inner = self.inner.lock();
            if inner.open.contains(scope) {
                return true;
            }
            let (tx, rx) = oneshot::channel();
            let waiters = inner.waiters.entry(scope.clone()).or_default();
            waiters.retain(|w| !w.is_closed());
            waiters.push(tx);
            rx
        };
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_open_scope_does_not_wait() {
        let gate = StoreGate::new();
        let scope = ScopeKey::app_public();
        assert_eq!(gate.release(&scope), 0);
        assert!(gate.wait_open(&scope, Duration::ZERO).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_wakes_every_waiter_once() {
        let gate = Arc::new(StoreGate::new());
        let scope = ScopeKey::user("u1").unwrap();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let gate = gate.clone();
            let scope = scope.clone();
            handles.push(tokio::spawn(async move {
                gate.wait_open(&scope, Duration::from_secs(10)).await
            }));
        }
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert_eq!(gate.release(&scope), 3);
        assert_eq!(gate.release(&scope), 0);
        for h in handles {
            assert!(h.await.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_reset() {
        let gate = StoreGate::new();
        let scope = ScopeKey::app_public();
        assert!(!gate.wait_open(&scope, Duration::from_secs(10)).await);

        gate.release(&scope);
        assert!(gate.is_open(&scope));
        gate.reset(&scope);
        assert!(!gate.is_open(&scope));
    }
}
