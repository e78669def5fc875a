//! Agent configuration constants.
//!
//! Centralizes defaults; [`AgentConfig`](crate::AgentConfig) overrides them.

use std::time::Duration;

/// Name of the activity timer every page runs.
pub const ACTIVITY_TIMER: &str = "activity";

/// How often pages report activity.
pub const ACTIVITY_INTERVAL: Duration = Duration::from_secs(30);

/// Floor for a configured activity interval.
pub const MIN_ACTIVITY_INTERVAL: Duration = Duration::from_millis(100);

/// A page idle for longer than this reports itself inactive.
pub const MAX_INACTIVE: Duration = Duration::from_secs(300);

/// How long a `may-update` advisory shields a collection from refresh overwrites.
pub const MAY_UPDATE_WINDOW: Duration = Duration::from_secs(5);

/// Capacity of the cross-context broadcast bus.
pub const BUS_CAPACITY: usize = 256;

/// Per-request timeout for the HTTP remote.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
