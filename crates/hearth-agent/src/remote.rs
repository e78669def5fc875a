//! Remote authoritative store contract.
//!
//! The remote owns document versions. Every mutating request carries the last
//! version the caller saw; a stale version is not rejected but merged per
//! property (see [`MemoryRemote`](crate::memory_remote::MemoryRemote)).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hearth_types::{Collection, Document, MutationOp, ScopeKey};

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote could not be reached. Pending writes stay queued for replay.
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A fetched document (or the requested subset of its collections).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteDocument {
    pub version: u64,
    pub collections: Document,
}

/// Per-collection part of a mutating request.
///
/// Puts carry `properties`; deletes carry `property_names`. A patch with
/// `replace` set (and no property names) addresses the whole collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionPatch {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Collection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_names: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replace: bool,
}

impl CollectionPatch {
    /// Write these properties, leaving others alone.
    pub fn merge(collection: impl Into<String>, properties: Collection) -> Self {
        Self {
            collection: collection.into(),
            properties: Some(properties),
            ..Default::default()
        }
    }

    /// Replace the collection body with `properties`.
    pub fn replace(collection: impl Into<String>, properties: Collection) -> Self {
        Self {
            collection: collection.into(),
            properties: Some(properties),
            replace: true,
            ..Default::default()
        }
    }

    pub fn remove_properties(collection: impl Into<String>, names: Vec<String>) -> Self {
        Self {
            collection: collection.into(),
            property_names: Some(names),
            ..Default::default()
        }
    }

    /// Delete the whole collection.
    pub fn remove_collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            replace: true,
            ..Default::default()
        }
    }
}

/// Wire body: `{version, collections: [{collection, properties|propertyNames}]}`.
///
/// `op` selects the verb (POST for put, DELETE for delete) and is not part of
/// the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip, default = "default_op")]
    pub op: MutationOp,
    pub collections: Vec<CollectionPatch>,
}

fn default_op() -> MutationOp {
    MutationOp::Put
}

impl MutationRequest {
    pub fn new(version: Option<u64>, op: MutationOp, collections: Vec<CollectionPatch>) -> Self {
        Self {
            version,
            op,
            collections,
        }
    }

    pub fn put(version: Option<u64>, patch: CollectionPatch) -> Self {
        Self::new(version, MutationOp::Put, vec![patch])
    }

    pub fn delete(version: Option<u64>, patch: CollectionPatch) -> Self {
        Self::new(version, MutationOp::Delete, vec![patch])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOutcome {
    pub new_version: u64,
    /// The request carried a stale (or no) version and was merged.
    #[serde(default)]
    pub conflict: bool,
}

/// The authoritative store the agent forwards writes to.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch a document, or one collection of it.
    async fn fetch(
        &self,
        scope: &ScopeKey,
        document: &str,
        collection: Option<&str>,
    ) -> Result<RemoteDocument, RemoteError>;

    async fn mutate(
        &self,
        scope: &ScopeKey,
        document: &str,
        request: MutationRequest,
    ) -> Result<MutationOutcome, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape_put() {
        let mut props = Collection::new();
        props.insert("theme".into(), json!("dark"));
        let req = MutationRequest::put(Some(3), CollectionPatch::merge("settings", props));
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "version": 3,
                "collections": [{"collection": "settings", "properties": {"theme": "dark"}}]
            })
        );
    }

    #[test]
    fn test_request_wire_shape_delete() {
        let req = MutationRequest::delete(
            None,
            CollectionPatch::remove_properties("settings", vec!["theme".into()]),
        );
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"collections": [{"collection": "settings", "propertyNames": ["theme"]}]})
        );
    }

    #[test]
    fn test_outcome_conflict_defaults_false() {
        let o: MutationOutcome = serde_json::from_value(json!({"newVersion": 7})).unwrap();
        assert_eq!(
            o,
            MutationOutcome {
                new_version: 7,
                conflict: false
            }
        );
    }
}
