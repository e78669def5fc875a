//! Shared key, mutation and protocol types for hearth.
//!
//! This crate is the vocabulary every other hearth crate speaks: the Key Codec
//! that turns scopes and paths into comparable keys, the typed [`Mutation`]
//! queued by page contexts, and the messages exchanged between a page and the
//! background agent. It has **no internal hearth dependencies** and performs no
//! I/O.
//!
//! # Data Model
//!
//! ```text
//! ScopeKey ("app:public", "user:3f9a…")
//!     └── Document ("home")            ← versioned by the remote store
//!           └── Collection ("settings")
//!                 └── Property ("theme") = JSON value   ← unit of LWW merge
//! ```
//!
//! # Key Types
//!
//! |------------------------|-------------------------------------------------|
//! | Type                   | Purpose                                         |
//! |------------------------|-------------------------------------------------|
//! | [`ScopeKey`]           | Top-level partition (kind + scope id)           |
//! | [`DocPath`]            | Scope/document/collection/property address      |
//! | [`PathKey`]            | Structured, value-comparable form of a path     |
//! | [`Mutation`]           | Queued put/delete against a path                |
//! | [`PageMessage`]        | page → agent protocol                           |
//! | [`AgentMessage`]       | agent → page protocol                           |
//! | [`ContextFlow`]        | cross-context broadcast between pages           |
//! | [`RequestSeed`]        | per-page manifest of requested collections      |
//! |------------------------|-------------------------------------------------|

pub mod ids;
pub mod keys;
pub mod mutation;
pub mod protocol;
pub mod seed;

pub use ids::PageId;
pub use keys::{
    DocPath, KeyError, PathKey, ScopeKey, ScopeKind, make_scope_key, parse_scope_key,
    parse_scope_kind, path_to_key,
};
pub use mutation::{Collection, Document, Mutation, MutationError, MutationOp, OpSource};
pub use protocol::{AgentMessage, COLLECTIONS_STORE, ContextFlow, PageMessage};
pub use seed::{RequestSeed, RequestSeedEntry, SeedFilter};
