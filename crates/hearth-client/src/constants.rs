//! Client configuration constants.

use std::time::Duration;

/// Quiet period after the last enqueue before the mutation queue drains.
pub const DEBOUNCE: Duration = Duration::from_millis(75);

/// How long `Engine::store` waits for a scope's initial data.
pub const STORE_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered engine notices per subscriber.
pub const NOTICE_CAPACITY: usize = 64;

/// Shortest tick an activity timer runs at; shorter requests are raised to it.
pub const MIN_TIMER_INTERVAL: Duration = Duration::from_millis(100);
