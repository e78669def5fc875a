//! # hearth-client
//!
//! The page side of hearth. An [`Engine`] gives a page synchronous,
//! observable [`Store`]s over the shared cache. Writes land in memory at once
//! and are pushed through a debounced [`MutationQueue`] to the cache and the
//! background agent; data the agent refetches is reconciled back into the
//! live stores.

pub mod config;
pub mod constants;
pub mod engine;
pub mod gate;
pub mod heartbeat;
pub mod queue;
pub mod seed;
pub mod sink;
pub mod store;

pub use config::ClientConfig;
pub use engine::{Engine, EngineError, EngineNotice, Listener, ListenerId, PageLifecycle};
pub use gate::StoreGate;
pub use heartbeat::{ActivityMonitor, Beacon, TimerSpec, TimerState};
pub use queue::{DrainReport, MutationQueue, MutationSink, QueueStats, SinkError};
pub use seed::{filter_seed, seed_covers, update_seed};
pub use sink::CacheSink;
pub use store::{Entry, Store, StoreError, StoreEvent, StoreHooks, StoreView};
