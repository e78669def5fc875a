//! Request seed manifest types.
//!
//! The transforms over these live in `hearth-client::seed`; this module only
//! defines the persisted shape.

use serde::{Deserialize, Serialize};

use crate::ids::PageId;
use crate::keys::ScopeKey;

/// One requested `(scope, document)` and the collections asked for.
///
/// An empty `collections` list means "all collections".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSeedEntry {
    pub scope_key: ScopeKey,
    pub document: String,
    #[serde(default)]
    pub collections: Vec<String>,
}

impl RequestSeedEntry {
    pub fn new(scope_key: ScopeKey, document: impl Into<String>, collections: Vec<String>) -> Self {
        Self {
            scope_key,
            document: document.into(),
            collections,
        }
    }

    pub fn all_collections(&self) -> bool {
        self.collections.is_empty()
    }
}

/// A page's manifest of what it has requested, persisted across reloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSeed {
    pub page: PageId,
    pub entries: Vec<RequestSeedEntry>,
}

impl RequestSeed {
    pub fn new(page: PageId) -> Self {
        Self {
            page,
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, scope_key: &ScopeKey, document: &str) -> Option<&RequestSeedEntry> {
        self.entries
            .iter()
            .find(|e| &e.scope_key == scope_key && e.document == document)
    }
}

/// Narrowing applied by `filter_seed`. `None` fields do not restrict.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedFilter {
    #[serde(default)]
    pub scope_keys: Option<Vec<ScopeKey>>,
    #[serde(default)]
    pub collections: Option<Vec<String>>,
}
