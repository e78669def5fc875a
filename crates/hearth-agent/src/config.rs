//! Agent configuration, loaded from the `[agent]` table of the hearth config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    ACTIVITY_INTERVAL, ACTIVITY_TIMER, BUS_CAPACITY, HTTP_TIMEOUT, MAX_INACTIVE,
    MAY_UPDATE_WINDOW, MIN_ACTIVITY_INTERVAL,
};

/// Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Timer started on every page that connects.
    pub activity_timer: String,
    pub activity_interval_ms: u64,
    pub max_inactive_ms: u64,
    pub may_update_window_ms: u64,
    pub bus_capacity: usize,
    pub http_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            activity_timer: ACTIVITY_TIMER.to_string(),
            activity_interval_ms: ACTIVITY_INTERVAL.as_millis() as u64,
            max_inactive_ms: MAX_INACTIVE.as_millis() as u64,
            may_update_window_ms: MAY_UPDATE_WINDOW.as_millis() as u64,
            bus_capacity: BUS_CAPACITY,
            http_timeout_ms: HTTP_TIMEOUT.as_millis() as u64,
        }
    }
}

impl AgentConfig {
    /// Tick interval sent with `heartbeat-start`, never below the floor.
    pub fn activity_interval(&self) -> Duration {
        Duration::from_millis(self.activity_interval_ms).max(MIN_ACTIVITY_INTERVAL)
    }

    /// Bus capacity, at least one.
    pub fn bus_capacity(&self) -> usize {
        self.bus_capacity.max(1)
    }

    pub fn may_update_window(&self) -> Duration {
        Duration::from_millis(self.may_update_window_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}
