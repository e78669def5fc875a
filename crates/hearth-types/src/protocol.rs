//! Page ↔ agent message protocol.
//!
//! Transport-agnostic: the in-process agent moves these over tokio channels,
//! but every message is also a serde value shaped like
//! `{"action": "batch-update", "scopeKey": "app:public", ...}` so the same
//! vocabulary can ride any IPC link.

use serde::{Deserialize, Serialize};

use crate::keys::ScopeKey;
use crate::mutation::MutationOp;

/// Name of the cache store `data-update` refers to.
pub const COLLECTIONS_STORE: &str = "collections";

/// Messages sent from a page context to the background agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
#[strum(serialize_all = "kebab-case")]
pub enum PageMessage {
    /// Request a fetch/refresh for a scope/document. `None` = all collections.
    RefreshData {
        scope_key: ScopeKey,
        document: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collections: Option<Vec<String>>,
    },
    /// Advisory: a local write to this collection is pending.
    MayUpdate {
        scope_key: ScopeKey,
        document: String,
        collection: String,
    },
    /// A coalesced write has been persisted locally and is ready to forward.
    BatchUpdate {
        scope_key: ScopeKey,
        document: String,
        collection: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        property: Option<String>,
        op: MutationOp,
    },
    /// Periodic activity report from a named timer.
    HeartbeatBeat { name: String, inactive: bool },
    /// The page is about to become unobservable; service all timers now.
    ServiceTimers { reason: String },
}

impl PageMessage {
    /// Wire action name, e.g. `"refresh-data"`.
    pub fn action(&self) -> &'static str {
        self.into()
    }

    pub fn scope_key(&self) -> Option<&ScopeKey> {
        match self {
            Self::RefreshData { scope_key, .. }
            | Self::MayUpdate { scope_key, .. }
            | Self::BatchUpdate { scope_key, .. } => Some(scope_key),
            Self::HeartbeatBeat { .. } | Self::ServiceTimers { .. } => None,
        }
    }
}

/// Messages sent from the background agent to a page context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
#[strum(serialize_all = "kebab-case")]
pub enum AgentMessage {
    /// The persistent cache has fresh data at these `(document, collection)` keys.
    ///
    /// An empty key list still signals that the scope is loaded.
    DataUpdate {
        scope_key: ScopeKey,
        store_name: String,
        keys: Vec<(String, String)>,
    },
    /// Run an activity timer. Durations in milliseconds.
    HeartbeatStart {
        name: String,
        #[serde(rename = "interval")]
        interval_ms: u64,
        #[serde(rename = "maxInactive")]
        max_inactive_ms: u64,
    },
    HeartbeatStop { name: String },
    /// Drain the mutation queue now.
    FlushNow { scope_keys: Vec<ScopeKey> },
}

impl AgentMessage {
    pub fn action(&self) -> &'static str {
        self.into()
    }
}

/// Cross-context broadcast between pages sharing one agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ContextFlow {
    LoggedIn { scope_key: ScopeKey },
    LoggedOut { scope_key: ScopeKey },
    StoreInvalidated { scope_key: ScopeKey },
}

impl ContextFlow {
    /// Subject for pattern-based subscription, e.g. `"auth.logout"`.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::LoggedIn { .. } => "auth.login",
            Self::LoggedOut { .. } => "auth.logout",
            Self::StoreInvalidated { .. } => "store.invalidated",
        }
    }

    pub fn scope_key(&self) -> &ScopeKey {
        match self {
            Self::LoggedIn { scope_key }
            | Self::LoggedOut { scope_key }
            | Self::StoreInvalidated { scope_key } => scope_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_message_wire_shape() {
        let msg = PageMessage::BatchUpdate {
            scope_key: ScopeKey::app_public(),
            document: "home".into(),
            collection: "settings".into(),
            property: Some("theme".into()),
            op: MutationOp::Put,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "action": "batch-update",
                "scopeKey": "app:public",
                "document": "home",
                "collection": "settings",
                "property": "theme",
                "op": "put",
            })
        );
        assert_eq!(msg.action(), "batch-update");
    }

    #[test]
    fn test_refresh_data_collections_optional() {
        let parsed: PageMessage = serde_json::from_value(json!({
            "action": "refresh-data",
            "scopeKey": "user:abc",
            "document": "home",
        }))
        .unwrap();
        assert_eq!(
            parsed,
            PageMessage::RefreshData {
                scope_key: ScopeKey::user("abc").unwrap(),
                document: "home".into(),
                collections: None,
            }
        );
    }

    #[test]
    fn test_action_names() {
        let beat = PageMessage::HeartbeatBeat {
            name: "activity".into(),
            inactive: false,
        };
        assert_eq!(beat.action(), "heartbeat-beat");
        assert!(beat.scope_key().is_none());

        let flush = AgentMessage::FlushNow { scope_keys: vec![] };
        assert_eq!(flush.action(), "flush-now");
    }

    #[test]
    fn test_data_update_keys_are_pairs() {
        let msg = AgentMessage::DataUpdate {
            scope_key: ScopeKey::app_public(),
            store_name: COLLECTIONS_STORE.into(),
            keys: vec![("home".into(), "settings".into())],
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["storeName"], "collections");
        assert_eq!(v["keys"], json!([["home", "settings"]]));
    }

    #[test]
    fn test_heartbeat_start_field_names() {
        let msg = AgentMessage::HeartbeatStart {
            name: "activity".into(),
            interval_ms: 30_000,
            max_inactive_ms: 300_000,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["interval"], 30_000);
        assert_eq!(v["maxInactive"], 300_000);
    }

    #[test]
    fn test_context_flow_subjects() {
        let flow = ContextFlow::LoggedOut {
            scope_key: ScopeKey::user("abc").unwrap(),
        };
        assert_eq!(flow.subject(), "auth.logout");
        assert_eq!(flow.scope_key().scope_id(), "abc");
        let v = serde_json::to_value(&flow).unwrap();
        assert_eq!(v["event"], "logged-out");
    }
}
