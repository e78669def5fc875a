//! Values and the typed mutations queued by page contexts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::keys::DocPath;

/// A collection: property name → JSON value.
pub type Collection = serde_json::Map<String, Value>;

/// A document: collection name → collection. Ordered for stable output.
pub type Document = BTreeMap<String, Collection>;

/// Whether a change originated in this page or arrived from elsewhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpSource {
    /// Written by this page (optimistic).
    Local,
    /// Reconciled from the cache after a refetch or another page's write.
    Remote,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MutationOp {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("value for collection {0} is not an object")]
    NotAnObject(DocPath),
    #[error("{0} does not name a collection")]
    DocumentLevel(DocPath),
}

/// A queued write. Consumed exactly once by the queue drain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Mutation {
    Put { path: DocPath, value: Value },
    Delete { path: DocPath },
}

impl Mutation {
    pub fn put(path: DocPath, value: Value) -> Self {
        Self::Put { path, value }
    }

    pub fn delete(path: DocPath) -> Self {
        Self::Delete { path }
    }

    pub fn op(&self) -> MutationOp {
        match self {
            Self::Put { .. } => MutationOp::Put,
            Self::Delete { .. } => MutationOp::Delete,
        }
    }

    pub fn path(&self) -> &DocPath {
        match self {
            Self::Put { path, .. } | Self::Delete { path } => path,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Put { value, .. } => Some(value),
            Self::Delete { .. } => None,
        }
    }

    /// Document-level mutations are local/UI events only.
    pub fn requires_network(&self) -> bool {
        self.path().has_collection()
    }

    /// Compute a collection's value after this mutation.
    ///
    /// `None` means the collection no longer exists. Only defined for
    /// collection- and property-level paths.
    pub fn collection_after(
        &self,
        current: Option<&Collection>,
    ) -> Result<Option<Collection>, MutationError> {
        let path = self.path();
        if !path.has_collection() {
            return Err(MutationError::DocumentLevel(path.clone()));
        }
        match (self, path.property_name()) {
            (Self::Put { value, .. }, None) => match value {
                Value::Object(map) => Ok(Some(map.clone())),
                _ => Err(MutationError::NotAnObject(path.clone())),
            },
            (Self::Delete { .. }, None) => Ok(None),
            (Self::Put { value, .. }, Some(prop)) => {
                let mut next = current.cloned().unwrap_or_default();
                next.insert(prop.to_string(), value.clone());
                Ok(Some(next))
            }
            (Self::Delete { .. }, Some(prop)) => Ok(current.map(|c| {
                let mut next = c.clone();
                next.remove(prop);
                next
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ScopeKey;
    use serde_json::json;

    fn prop(p: &str) -> DocPath {
        DocPath::property(ScopeKey::app_public(), "home", "settings", p).unwrap()
    }

    fn col() -> DocPath {
        DocPath::collection(ScopeKey::app_public(), "home", "settings").unwrap()
    }

    fn obj(v: Value) -> Collection {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_requires_network_only_with_collection() {
        let doc = DocPath::document(ScopeKey::app_public(), "home").unwrap();
        assert!(!Mutation::delete(doc).requires_network());
        assert!(Mutation::delete(col()).requires_network());
        assert!(Mutation::put(prop("theme"), json!("dark")).requires_network());
    }

    #[test]
    fn test_property_put_creates_collection() {
        let m = Mutation::put(prop("theme"), json!("dark"));
        let next = m.collection_after(None).unwrap().unwrap();
        assert_eq!(next, obj(json!({"theme": "dark"})));
    }

    #[test]
    fn test_property_delete_keeps_others() {
        let current = obj(json!({"a": 1, "b": 2}));
        let next = Mutation::delete(prop("a"))
            .collection_after(Some(&current))
            .unwrap()
            .unwrap();
        assert_eq!(next, obj(json!({"b": 2})));
        assert_eq!(Mutation::delete(prop("a")).collection_after(None).unwrap(), None);
    }

    #[test]
    fn test_collection_put_replaces_and_requires_object() {
        let current = obj(json!({"a": 1}));
        let next = Mutation::put(col(), json!({"b": 2}))
            .collection_after(Some(&current))
            .unwrap();
        assert_eq!(next, Some(obj(json!({"b": 2}))));
        assert!(matches!(
            Mutation::put(col(), json!(3)).collection_after(None),
            Err(MutationError::NotAnObject(_))
        ));
    }

    #[test]
    fn test_document_level_has_no_collection_value() {
        let doc = DocPath::document(ScopeKey::app_public(), "home").unwrap();
        assert!(matches!(
            Mutation::delete(doc).collection_after(None),
            Err(MutationError::DocumentLevel(_))
        ));
    }

    #[test]
    fn test_serde_shape() {
        let m = Mutation::put(prop("theme"), json!("dark"));
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["op"], "put");
        assert_eq!(v["path"], json!(["app:public", "home", "settings", "theme"]));
        assert_eq!(MutationOp::Delete.to_string(), "delete");
    }
}
