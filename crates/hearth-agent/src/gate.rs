//! FIFO critical-section gate.
//!
//! Callers take a numbered [`Ticket`] synchronously, which fixes their place in
//! line at call time. Awaiting the ticket yields a [`GateGuard`] once every
//! earlier ticket has been served; dropping the guard lets the next ticket in.
//! Strict arrival order, no priorities, no starvation.
//!
//! A ticket dropped before it is served (or whose `wait` future is cancelled)
//! is marked abandoned and skipped when its turn comes.
//!
//! ```ignore
//! let gate = FifoGate::new();
//! let ticket = gate.ticket();          // position reserved here
//! tokio::spawn(async move {
//!     let _guard = ticket.wait().await; // runs after all earlier tickets
//!     apply_against_version().await;
//! });
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use hearth_types::ScopeKey;

#[derive(Debug, Default)]
struct GateState {
    serving: u64,
    next: u64,
    abandoned: BTreeSet<u64>,
}

impl GateState {
    fn finish(&mut self, number: u64) {
        if self.serving == number {
            self.serving += 1;
            while self.abandoned.remove(&self.serving) {
                self.serving += 1;
            }
        } else {
            self.abandoned.insert(number);
        }
    }
}

/// Mutual exclusion with strict arrival-order hand-off.
#[derive(Clone, Debug)]
pub struct FifoGate {
    state: Arc<watch::Sender<GateState>>,
}

impl Default for FifoGate {
    fn default() -> Self {
        Self::new()
    }
}

impl FifoGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(GateState::default());
        Self {
            state: Arc::new(tx),
        }
    }

    /// Reserve the next position in line.
    pub fn ticket(&self) -> Ticket {
        let mut number = 0;
        self.state.send_modify(|s| {
            number = s.next;
            s.next += 1;
        });
        Ticket {
            state: self.state.clone(),
            number,
            armed: true,
        }
    }

    /// Take a ticket and wait for it. The position is reserved when the
    /// returned future is first polled; use [`ticket`](Self::ticket) to fix it
    /// earlier.
    pub async fn acquire(&self) -> GateGuard {
        self.ticket().wait().await
    }

    /// Tickets issued but not yet finished (including the one being served).
    pub fn outstanding(&self) -> u64 {
        let s = self.state.borrow();
        s.next - s.serving - s.abandoned.len() as u64
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }
}

/// A reserved position in a [`FifoGate`] queue.
#[derive(Debug)]
pub struct Ticket {
    state: Arc<watch::Sender<GateState>>,
    number: u64,
    armed: bool,
}

impl Ticket {
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Wait until every earlier ticket has finished.
    pub async fn wait(mut self) -> GateGuard {
        let mut rx = self.state.subscribe();
        // The sender lives in `self.state`, so the channel cannot close here.
        let _ = rx.wait_for(|s| s.serving == self.number).await;
        self.armed = false;
        GateGuard {
            state: self.state.clone(),
            number: self.number,
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.armed {
            let number = self.number;
            self.state.send_modify(|s| s.finish(number));
        }
    }
}

/// Held while inside the critical section. Dropping it admits the next ticket.
#[derive(Debug)]
pub struct GateGuard {
    state: Arc<watch::Sender<GateState>>,
    number: u64,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let number = self.number;
        self.state.send_modify(|s| s.finish(number));
    }
}

// ============================================================================
// Per-document gates
// ============================================================================

/// One gate per `(scope, document)`, created on first use.
#[derive(Debug, Default)]
pub struct GateMap {
    gates: DashMap<(ScopeKey, String), FifoGate>,
}

impl GateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate(&self, scope: &ScopeKey, document: &str) -> FifoGate {
        self.gates
            .entry((scope.clone(), document.to_string()))
            .or_default()
            .clone()
    }

    /// Whether every gate is idle.
    pub fn all_idle(&self) -> bool {
        self.gates.iter().all(|g| g.is_idle())
    }
}
