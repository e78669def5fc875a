//! Page-context configuration, loaded from the `[client]` table of the hearth config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEBOUNCE, NOTICE_CAPACITY, STORE_WAIT_TIMEOUT};

/// Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub debounce_ms: u64,
    pub store_wait_timeout_ms: u64,
    pub notice_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEBOUNCE.as_millis() as u64,
            store_wait_timeout_ms: STORE_WAIT_TIMEOUT.as_millis() as u64,
            notice_capacity: NOTICE_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn store_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.store_wait_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.debounce(), Duration::from_millis(75));
        assert_eq!(cfg.store_wait_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_table() {
        let cfg: ClientConfig = toml::from_str("debounce_ms = 50").unwrap();
        assert_eq!(cfg.debounce_ms, 50);
        assert_eq!(cfg.notice_capacity, NOTICE_CAPACITY);
    }
}
