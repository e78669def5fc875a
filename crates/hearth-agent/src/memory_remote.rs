//! In-memory reference implementation of the remote store.
//!
//! Merge rule for a request carrying version `v` against current version `c`:
//!
//! - `v == c`: applied as sent. A collection replace or delete removes every
//!   property the request does not carry.
//! - otherwise (stale or absent): every property the request names explicitly
//!   (written or deleted) is applied, so the last arrival wins per property.
//!   Bulk removals implied by a replace or collection delete only remove
//!   properties that nobody has written since `v`.
//!
//! Every accepted request advances the version by one and the response reports
//! whether the merge path was taken.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use hearth_types::{Collection, Document, ScopeKey};

use crate::remote::{
    CollectionPatch, MutationOutcome, MutationRequest, RemoteDocument, RemoteError, RemoteStore,
};

#[derive(Debug, Default)]
struct DocState {
    version: u64,
    collections: Document,
    /// (collection, property) → version of the last write or delete.
    touched: HashMap<(String, String), u64>,
}

impl DocState {
    fn written_since(&self, collection: &str, property: &str, base: u64) -> bool {
        self.touched
            .get(&(collection.to_string(), property.to_string()))
            .is_some_and(|&v| v > base)
    }

    fn touch(&mut self, collection: &str, property: &str, version: u64) {
        self.touched
            .insert((collection.to_string(), property.to_string()), version);
    }

    fn apply_patch(&mut self, patch: &CollectionPatch, base: Option<u64>, version: u64) {
        let name = patch.collection.as_str();
        let mut body = self.collections.remove(name).unwrap_or_default();

        if patch.replace {
            let keep: Vec<String> = body
                .keys()
                .filter(|k| {
                    let carried = patch
                        .properties
                        .as_ref()
                        .is_some_and(|props| props.contains_key(*k));
                    carried || base.is_some_and(|b| self.written_since(name, k, b))
                })
                .cloned()
                .collect();
            let removed: Vec<String> = body
                .keys()
                .filter(|k| !keep.contains(k))
                .cloned()
                .collect();
            for k in removed {
                body.remove(&k);
                self.touch(name, &k, version);
            }
        }

        if let Some(props) = &patch.properties {
            for (k, v) in props {
                body.insert(k.clone(), v.clone());
                self.touch(name, k, version);
            }
        }

        if let Some(names) = &patch.property_names {
            for k in names {
                body.remove(k);
                self.touch(name, k, version);
            }
        }

        let collection_deleted = patch.replace && patch.properties.is_none();
        if !(collection_deleted && body.is_empty()) {
            self.collections.insert(name.to_string(), body);
        }
    }
}

/// Authoritative store held in memory.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    docs: Mutex<HashMap<(ScopeKey, String), DocState>>,
    offline: AtomicBool,
    mutations: AtomicUsize,
    fetches: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a document at a given version.
    pub fn seed_document(&self, scope: &ScopeKey, document: &str, version: u64, body: Document) {
        self.docs.lock().insert(
            (scope.clone(), document.to_string()),
            DocState {
                version,
                collections: body,
                touched: HashMap::new(),
            },
        );
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    pub fn snapshot(&self, scope: &ScopeKey, document: &str) -> RemoteDocument {
        let docs = self.docs.lock();
        docs.get(&(scope.clone(), document.to_string()))
            .map(|d| RemoteDocument {
                version: d.version,
                collections: d.collections.clone(),
            })
            .unwrap_or_default()
    }

    pub fn collection(
        &self,
        scope: &ScopeKey,
        document: &str,
        collection: &str,
    ) -> Option<Collection> {
        self.snapshot(scope, document)
            .collections
            .remove(collection)
    }

    /// Accepted mutating requests so far.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("memory remote is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch(
        &self,
        scope: &ScopeKey,
        document: &str,
        collection: Option<&str>,
    ) -> Result<RemoteDocument, RemoteError> {
        self.check_online()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut doc = self.snapshot(scope, document);
        if let Some(name) = collection {
            doc.collections.retain(|k, _| k == name);
        }
        Ok(doc)
    }

    async fn mutate(
        &self,
        scope: &ScopeKey,
        document: &str,
        request: MutationRequest,
    ) -> Result<MutationOutcome, RemoteError> {
        self.check_online()?;
        let mut docs = self.docs.lock();
        let state = docs
            .entry((scope.clone(), document.to_string()))
            .or_default();

        let conflict = request.version != Some(state.version);
        // A stale writer only gets bulk removals over properties untouched since its base.
        let base = conflict.then(|| request.version.unwrap_or(0));
        let next = state.version + 1;

        for patch in &request.collections {
            state.apply_patch(patch, base, next);
        }
        state.version = next;
        self.mutations.fetch_add(1, Ordering::SeqCst);

        debug!(
            scope = %scope,
            document,
            sent = ?request.version,
            new_version = next,
            conflict,
            "memory remote applied mutation"
        );
        Ok(MutationOutcome {
            new_version: next,
            conflict,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn obj(v: Value) -> Collection {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn doc(col: &str, body: Value) -> Document {
        Document::from([(col.to_string(), obj(body))])
    }

    fn scope() -> ScopeKey {
        ScopeKey::app_public()
    }

    fn merge(col: &str, body: Value) -> CollectionPatch {
        CollectionPatch::merge(col, obj(body))
    }

    #[tokio::test]
    async fn test_clean_write_advances_version() {
        let remote = MemoryRemote::new();
        remote.seed_document(&scope(), "home", 3, doc("c", json!({"p1": "a"})));

        let out = remote
            .mutate(
                &scope(),
                "home",
                MutationRequest::put(Some(3), merge("c", json!({"p1": "a2"}))),
            )
            .await
            .unwrap();
        assert_eq!(out, MutationOutcome { new_version: 4, conflict: false });
        assert_eq!(remote.collection(&scope(), "home", "c"), Some(obj(json!({"p1": "a2"}))));
    }

    #[tokio::test]
    async fn test_merge_convergence_of_concurrent_sets() {
        let remote = MemoryRemote::new();
        remote.seed_document(
            &scope(),
            "home",
            1,
            doc("c", json!({"p1": "o1", "p2": "o2", "p3": "o3", "p4": "o4"})),
        );

        // Set A against version 1.
        remote
            .mutate(
                &scope(),
                "home",
                MutationRequest::put(
                    Some(1),
                    CollectionPatch::merge("c", obj(json!({"p1": "a1", "p2": "a2", "p5": "a5"}))),
                ),
            )
            .await
            .unwrap();

        // Set B, also against version 1.
        let b1 = remote
            .mutate(
                &scope(),
                "home",
                MutationRequest::put(
                    Some(1),
                    CollectionPatch::merge("c", obj(json!({"p2": "b2", "p3": "b3", "p6": "b6"}))),
                ),
            )
            .await
            .unwrap();
        assert!(b1.conflict);
        let b2 = remote
            .mutate(
                &scope(),
                "home",
                MutationRequest::delete(
                    Some(1),
                    CollectionPatch::remove_properties("c", vec!["p1".into()]),
                ),
            )
            .await
            .unwrap();
        assert!(b2.conflict);

        assert_eq!(
            remote.collection(&scope(), "home", "c"),
            Some(obj(json!({
                "p2": "b2",
                "p3": "b3",
                "p4": "o4",
                "p5": "a5",
                "p6": "b6",
            })))
        );
        assert_eq!(remote.snapshot(&scope(), "home").version, 4);
    }

    #[tokio::test]
    async fn test_stale_delete_does_not_resurrect() {
        let remote = MemoryRemote::new();
        remote.seed_document(&scope(), "home", 3, doc("c", json!({"p1": "a", "p2": "b"})));

        let first = remote
            .mutate(
                &scope(),
                "home",
                MutationRequest::put(Some(3), merge("c", json!({"p1": "a2"}))),
            )
            .await
            .unwrap();
        assert_eq!(first.new_version, 4);

        let second = remote
            .mutate(
                &scope(),
                "home",
                MutationRequest::delete(
                    Some(3),
                    CollectionPatch::remove_properties("c", vec!["p2".into()]),
                ),
            )
            .await
            .unwrap();
        assert_eq!(second, MutationOutcome { new_version: 5, conflict: true });
        assert_eq!(remote.collection(&scope(), "home", "c"), Some(obj(json!({"p1": "a2"}))));
    }

    #[tokio::test]
    async fn test_stale_replace_spares_newer_properties() {
        let remote = MemoryRemote::new();
        remote.seed_document(&scope(), "home", 1, doc("c", json!({"p1": "o1", "p2": "o2"})));

        remote
            .mutate(
                &scope(),
                "home",
                MutationRequest::put(Some(1), merge("c", json!({"p3": "a3"}))),
            )
            .await
            .unwrap();
        remote
            .mutate(
                &scope(),
                "home",
                MutationRequest::put(
                    Some(1),
                    CollectionPatch::replace("c", obj(json!({"p2": "b2"}))),
                ),
            )
            .await
            .unwrap();

        assert_eq!(
            remote.collection(&scope(), "home", "c"),
            Some(obj(json!({"p2": "b2", "p3": "a3"})))
        );
    }

    #[tokio::test]
    async fn test_clean_collection_delete_removes_everything() {
        let remote = MemoryRemote::new();
        remote.seed_document(&scope(), "home", 2, doc("c", json!({"p1": 1})));
        remote
            .mutate(
                &scope(),
                "home",
                MutationRequest::delete(Some(2), CollectionPatch::remove_collection("c")),
            )
            .await
            .unwrap();
        assert_eq!(remote.collection(&scope(), "home", "c"), None);
    }

    #[tokio::test]
    async fn test_offline_is_unavailable() {
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let err = remote.fetch(&scope(), "home", None).await.unwrap_err();
        assert!(err.is_unavailable());
        remote.set_online(true);
        let doc = remote.fetch(&scope(), "home", None).await.unwrap();
        assert_eq!(doc.version, 0);
        assert_eq!(remote.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_single_collection() {
        let remote = MemoryRemote::new();
        let mut body = doc("a", json!({"x": 1}));
        body.insert("b".into(), obj(json!({"y": 2})));
        remote.seed_document(&scope(), "home", 1, body);

        let fetched = remote.fetch(&scope(), "home", Some("b")).await.unwrap();
        assert_eq!(fetched.collections.len(), 1);
        assert!(fetched.collections.contains_key("b"));
    }
}
