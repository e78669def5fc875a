//! # hearth-agent
//!
//! The long-lived background agent that mediates between page contexts, the
//! persistent local cache and the remote authoritative store.
//!
//! The agent:
//! - Owns the shared SQLite cache ([`CacheDb`]) every page reads from
//! - Forwards batch-updates to the [`RemoteStore`] carrying the last known
//!   document version, serialized per document by a [`FifoGate`]
//! - Refetches after version conflicts and fans out `data-update` to pages
//! - Keeps unacknowledged writes in the cache for replay after going offline
//! - Turns page inactivity and visibility loss into `flush-now` for every page
//!   sharing a scope
//! - Listens on the cross-context [`FlowBus`] and purges a scope on logout

pub mod agent;
pub mod cache;
pub mod config;
pub mod constants;
pub mod flows;
pub mod gate;
pub mod http_remote;
pub mod memory_remote;
pub mod remote;

pub use agent::{AgentError, AgentHandle, PageLink, ReplayReport, spawn_agent};
pub use cache::{CacheDb, CacheError, CacheResult, PendingWrite, SharedCache};
pub use config::AgentConfig;
pub use flows::{
    FlowBus, FlowMessage, HasSubject, SharedContextBus, Subscription, matches_pattern,
    shared_context_bus,
};
pub use gate::{FifoGate, GateGuard, GateMap, Ticket};
pub use http_remote::HttpRemote;
pub use memory_remote::MemoryRemote;
pub use remote::{
    CollectionPatch, MutationOutcome, MutationRequest, RemoteDocument, RemoteError, RemoteStore,
};
