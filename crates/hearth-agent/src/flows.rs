//! Cross-context broadcast bus.
//!
//! Pages sharing one agent announce login, logout and store invalidation over a
//! [`FlowBus`]. Subscribers filter with NATS-style subject patterns:
//!
//! - `*` matches exactly one token: `auth.*` matches `auth.login` but not `auth.token.expired`
//! - `>` matches one or more tokens (only at end): `auth.>` matches both
//! - Exact match: `store.invalidated` only matches `store.invalidated`
//!
//! ```ignore
//! let bus = FlowBus::<ContextFlow>::new(256);
//! let mut sub = bus.subscribe("auth.*");
//! bus.publish_from(ContextFlow::LoggedOut { scope_key }, page);
//! while let Some(msg) = sub.recv().await { ... }
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use hearth_types::{ContextFlow, PageId};

// ============================================================================
// Pattern Matching
// ============================================================================

/// Check if a subject matches a NATS-style pattern.
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            // `>` must be last and swallows everything that remains
            ">" => return pi == pattern_tokens.len() - 1,
            "*" => {
                pi += 1;
                si += 1;
            }
            token => {
                if token != subject_tokens[si] {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }

    pi == pattern_tokens.len() && si == subject_tokens.len()
}

// ============================================================================
// Messages
// ============================================================================

/// Payloads that know their subject.
pub trait HasSubject {
    fn subject(&self) -> &str;
}

impl HasSubject for ContextFlow {
    fn subject(&self) -> &str {
        ContextFlow::subject(self)
    }
}

/// A message published to the bus.
#[derive(Clone, Debug)]
pub struct FlowMessage<T> {
    pub subject: String,
    pub payload: T,
    pub timestamp: Instant,
    /// Publishing page, so engines can ignore their own echoes.
    pub sender: Option<PageId>,
}

impl<T: HasSubject> FlowMessage<T> {
    pub fn new(payload: T, sender: Option<PageId>) -> Self {
        Self {
            subject: payload.subject().to_string(),
            payload,
            timestamp: Instant::now(),
            sender,
        }
    }
}

// ============================================================================
// FlowBus
// ============================================================================

/// Typed broadcast bus with pattern-filtered subscriptions.
pub struct FlowBus<T: Clone + Send + 'static> {
    tx: broadcast::Sender<FlowMessage<T>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> FlowBus<T> {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + HasSubject + 'static> FlowBus<T> {
    /// Publish without a sender. Returns the number of receivers.
    pub fn publish(&self, payload: T) -> usize {
        self.tx.send(FlowMessage::new(payload, None)).unwrap_or(0)
    }

    /// Publish on behalf of a page.
    pub fn publish_from(&self, payload: T, sender: PageId) -> usize {
        self.tx
            .send(FlowMessage::new(payload, Some(sender)))
            .unwrap_or(0)
    }

    pub fn subscribe(&self, pattern: &str) -> Subscription<T> {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone + Send + 'static> Clone for FlowBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// A pattern-filtered subscription.
pub struct Subscription<T: Clone> {
    pattern: String,
    rx: broadcast::Receiver<FlowMessage<T>>,
}

impl<T: Clone> Subscription<T> {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receive the next matching message. `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        lagged = n,
                        "Flow subscription lagged behind"
                    );
                }
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        lagged = n,
                        "Flow subscription lagged behind"
                    );
                }
            }
        }
    }
}

/// The bus every page engine and the agent share.
pub type SharedContextBus = Arc<FlowBus<ContextFlow>>;

pub fn shared_context_bus(capacity: usize) -> SharedContextBus {
    Arc::new(FlowBus::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_types::ScopeKey;

    #[test]
    fn test_pattern_matching_exact() {
        assert!(matches_pattern("auth.login", "auth.login"));
        assert!(!matches_pattern("auth.login", "auth.logout"));
        assert!(!matches_pattern("auth.login", "auth.login.extra"));
    }

    #[test]
    fn test_pattern_matching_wildcards() {
        assert!(matches_pattern("auth.*", "auth.logout"));
        assert!(!matches_pattern("auth.*", "store.invalidated"));
        assert!(matches_pattern(">", "store.invalidated"));
        assert!(matches_pattern("auth.>", "auth.token.expired"));
        assert!(!matches_pattern("auth.>", "auth"));
        assert!(matches_pattern("*.invalidated", "store.invalidated"));
    }

    #[tokio::test]
    async fn test_subscription_filters_by_pattern() {
        let bus = FlowBus::<ContextFlow>::new(16);
        let mut auth = bus.subscribe("auth.*");
        let page = PageId::new();

        bus.publish(ContextFlow::StoreInvalidated {
            scope_key: ScopeKey::app_public(),
        });
        bus.publish_from(
            ContextFlow::LoggedOut {
                scope_key: ScopeKey::user("u1").unwrap(),
            },
            page,
        );

        let msg = auth.recv().await.unwrap();
        assert_eq!(msg.subject, "auth.logout");
        assert_eq!(msg.sender, Some(page));
        assert!(auth.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_returns_none_when_bus_dropped() {
        let bus = FlowBus::<ContextFlow>::new(4);
        let mut sub = bus.subscribe(">");
        assert_eq!(bus.subscriber_count(), 1);
        drop(bus);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_zero_capacity_bus_still_delivers() {
        let bus = shared_context_bus(0);
        let mut sub = bus.subscribe(">");
        bus.publish(ContextFlow::StoreInvalidated {
            scope_key: ScopeKey::app_public(),
        });
        assert_eq!(sub.try_recv().unwrap().subject, "store.invalidated");
    }

    #[test]
    fn test_lagged_subscriber_continues() {
        let bus = FlowBus::<ContextFlow>::new(2);
        let mut sub = bus.subscribe(">");
        for i in 0..5 {
            bus.publish(ContextFlow::LoggedIn {
                scope_key: ScopeKey::user(format!("u{i}")).unwrap(),
            });
        }
        let msg = sub.try_recv().unwrap();
        assert_eq!(msg.payload.scope_key().scope_id(), "u3");
    }
}
