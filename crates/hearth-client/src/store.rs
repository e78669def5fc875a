//! In-memory document tree for one scope.
//!
//! Reads are synchronous against the tree. Writes update the tree, notify
//! listeners, and enqueue a [`Mutation`] for the cache and agent; they never
//! wait on either. Replacing or deleting a whole document is decomposed into
//! one event and one mutation per affected collection.
//!
//! Navigation goes through [`StoreView`]: a path of segments into the tree,
//! `document / collection / property / nested...`. Reading a key yields an
//! [`Entry`]: a branch view for documents, collections and object values, or a
//! plain value for everything else.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use hearth_types::{
    Collection, DocPath, Document, KeyError, Mutation, MutationOp, OpSource, ScopeKey,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("malformed value at {path}: {reason}")]
    Malformed { path: String, reason: String },
    #[error(transparent)]
    Key(#[from] KeyError),
}

fn malformed(full: &[String], reason: impl Into<String>) -> StoreError {
    StoreError::Malformed {
        path: full.join("/"),
        reason: reason.into(),
    }
}

/// A change to the tree, as delivered to listeners.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreEvent {
    pub op: MutationOp,
    pub path: DocPath,
    /// The new value for puts.
    pub value: Option<Value>,
    pub origin: OpSource,
}

/// What the store calls out to on every write.
pub trait StoreHooks: Send + Sync + 'static {
    fn notify(&self, event: &StoreEvent);
    fn enqueue(&self, mutation: Mutation);
}

struct StoreCore {
    scope: ScopeKey,
    documents: RwLock<BTreeMap<String, Document>>,
    hooks: Arc<dyn StoreHooks>,
}

/// One scope's documents. Cheap to clone; clones share the tree.
#[derive(Clone)]
pub struct Store {
    core: Arc<StoreCore>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("scope", &self.core.scope)
            .field("documents", &self.core.documents.read().len())
            .finish()
    }
}

impl Store {
    pub fn new(
        scope: ScopeKey,
        documents: BTreeMap<String, Document>,
        hooks: Arc<dyn StoreHooks>,
    ) -> Self {
        Self {
            core: Arc::new(StoreCore {
                scope,
                documents: RwLock::new(documents),
                hooks,
            }),
        }
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.core.scope
    }

    /// Whether two handles refer to the same store instance.
    pub fn same_instance(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub fn root(&self) -> StoreView {
        StoreView {
            store: self.clone(),
            segments: Vec::new(),
        }
    }

    pub fn view<S: AsRef<str>>(&self, segments: &[S]) -> StoreView {
        StoreView {
            store: self.clone(),
            segments: segments.iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    pub fn document_names(&self) -> Vec<String> {
        self.core.documents.read().keys().cloned().collect()
    }

    pub fn get(&self, document: &str) -> Option<Entry> {
        self.root().get(document)
    }

    pub fn set<T: Serialize>(&self, document: &str, value: T) -> Result<(), StoreError> {
        self.root().set(document, value)
    }

    pub fn delete(&self, document: &str) -> Result<bool, StoreError> {
        self.root().delete(document)
    }

    pub fn collection(&self, document: &str, collection: &str) -> Option<Collection> {
        self.core
            .documents
            .read()
            .get(document)
            .and_then(|d| d.get(collection))
            .cloned()
    }

    /// Drop a document from this page only. The cache forgets it too, but no
    /// network write is made; the next refresh brings it back.
    pub fn evict(&self, document: &str) -> Result<bool, StoreError> {
        let path = DocPath::document(self.core.scope.clone(), document)?;
        let removed = self.core.documents.write().remove(document);
        let Some(removed) = removed else {
            return Ok(false);
        };
        for name in removed.keys() {
            self.core.hooks.notify(&StoreEvent {
                op: MutationOp::Delete,
                path: path.child(name)?,
                value: None,
                origin: OpSource::Local,
            });
        }
        self.core.hooks.enqueue(Mutation::delete(path));
        Ok(true)
    }

    /// Replace a collection with what the cache now holds.
    ///
    /// Returns the previous value when something changed, after notifying
    /// listeners with a remote-origin event.
    pub(crate) fn reconcile(
        &self,
        document: &str,
        collection: &str,
        next: Option<Collection>,
    ) -> Result<Option<Option<Collection>>, StoreError> {
        let path = DocPath::collection(self.core.scope.clone(), document, collection)?;
        let previous = {
            let mut docs = self.core.documents.write();
            let current = docs.get(document).and_then(|d| d.get(collection)).cloned();
            if current == next {
                return Ok(None);
            }
            match &next {
                Some(body) => {
                    docs.entry(document.to_string())
                        .or_default()
                        .insert(collection.to_string(), body.clone());
                }
                None => {
                    if let Some(doc) = docs.get_mut(document) {
                        doc.remove(collection);
                        if doc.is_empty() {
                            docs.remove(document);
                        }
                    }
                }
            }
            current
        };

        let op = if next.is_some() {
            MutationOp::Put
        } else {
            MutationOp::Delete
        };
        self.core.hooks.notify(&StoreEvent {
            op,
            path,
            value: next.map(Value::Object),
            origin: OpSource::Remote,
        });
        Ok(Some(previous))
    }
}

/// A position in the tree.
#[derive(Clone, Debug)]
pub struct StoreView {
    store: Store,
    segments: Vec<String>,
}

/// The result of reading a key.
#[derive(Clone, Debug)]
pub enum Entry {
    Value(Value),
    Branch(StoreView),
}

impl Entry {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Branch(_) => None,
        }
    }

    pub fn as_branch(&self) -> Option<&StoreView> {
        match self {
            Self::Branch(view) => Some(view),
            Self::Value(_) => None,
        }
    }

    /// Snapshot the entry as plain JSON.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Value(v) => v.clone(),
            Self::Branch(view) => view.value().unwrap_or(Value::Null),
        }
    }
}

impl StoreView {
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Snapshot of the value at this position, if it exists.
    pub fn value(&self) -> Option<Value> {
        let docs = self.store.core.documents.read();
        read_at(&docs, &self.segments)
    }

    pub fn keys(&self) -> Vec<String> {
        match self.value() {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Entry> {
        let full = self.extended(key);
        let value = read_at(&self.store.core.documents.read(), &full)?;
        if full.len() <= 2 || value.is_object() {
            Some(Entry::Branch(StoreView {
                store: self.store.clone(),
                segments: full,
            }))
        } else {
            Some(Entry::Value(value))
        }
    }

    /// Write `value` under `key`.
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<(), StoreError> {
        let full = self.extended(key);
        let value = serde_json::to_value(value).map_err(|e| malformed(&full, e.to_string()))?;
        self.store.core.write(&full, Some(value)).map(|_| ())
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let full = self.extended(key);
        self.store.core.write(&full, None)
    }

    fn extended(&self, key: &str) -> Vec<String> {
        let mut full = self.segments.clone();
        full.push(key.to_string());
        full
    }
}

// ============================================================================
// Tree access
// ============================================================================

fn read_at(docs: &BTreeMap<String, Document>, segments: &[String]) -> Option<Value> {
    match segments {
        [] => Some(Value::Object(
            docs.iter()
                .map(|(name, doc)| (name.clone(), document_value(doc)))
                .collect(),
        )),
        [doc] => docs.get(doc).map(document_value),
        [doc, col] => docs
            .get(doc)
            .and_then(|d| d.get(col))
            .map(|c| Value::Object(c.clone())),
        [doc, col, prop, nested @ ..] => {
            let mut value = docs.get(doc)?.get(col)?.get(prop)?;
            for key in nested {
                value = value.as_object()?.get(key)?;
            }
            Some(value.clone())
        }
    }
}

fn document_value(doc: &Document) -> Value {
    Value::Object(
        doc.iter()
            .map(|(name, c)| (name.clone(), Value::Object(c.clone())))
            .collect(),
    )
}

fn document_from_value(full: &[String], value: Value) -> Result<Document, StoreError> {
    let Value::Object(map) = value else {
        return Err(malformed(full, "a document must be an object of collections"));
    };
    map.into_iter()
        .map(|(name, body)| match body {
            Value::Object(c) => Ok((name, c)),
            _ => Err(malformed(full, format!("collection {name} is not an object"))),
        })
        .collect()
}

type Change = (StoreEvent, Mutation);

fn change(path: DocPath, value: Option<Value>) -> Change {
    match value {
        Some(v) => (
            StoreEvent {
                op: MutationOp::Put,
                path: path.clone(),
                value: Some(v.clone()),
                origin: OpSource::Local,
            },
            Mutation::put(path, v),
        ),
        None => (
            StoreEvent {
                op: MutationOp::Delete,
                path: path.clone(),
                value: None,
                origin: OpSource::Local,
            },
            Mutation::delete(path),
        ),
    }
}

impl StoreCore {
    /// Apply a write to the tree, then notify and enqueue outside the lock.
    ///
    /// Returns whether the target existed before (deletes) or was written (puts).
    fn write(&self, full: &[String], value: Option<Value>) -> Result<bool, StoreError> {
        let changes = {
            let mut docs = self.documents.write();
            match full.len() {
                0 => return Err(malformed(full, "empty path")),
                1 => self.write_document(&mut docs, full, value)?,
                2 | 3 => self.write_direct(&mut docs, full, value)?,
                _ => self.write_nested(&mut docs, full, value)?,
            }
        };
        let Some(changes) = changes else {
            return Ok(false);
        };
        for (event, _) in &changes {
            self.hooks.notify(event);
        }
        for (_, mutation) in changes {
            self.hooks.enqueue(mutation);
        }
        Ok(true)
    }

    fn write_document(
        &self,
        docs: &mut BTreeMap<String, Document>,
        full: &[String],
        value: Option<Value>,
    ) -> Result<Option<Vec<Change>>, StoreError> {
        let name = &full[0];
        let path = DocPath::document(self.scope.clone(), name.as_str())?;
        let next = match value {
            Some(v) => Some(document_from_value(full, v)?),
            None => None,
        };
        let current = docs.get(name).cloned();
        if current.is_none() && next.is_none() {
            return Ok(None);
        }

        let old = current.unwrap_or_default();
        let new = next.clone().unwrap_or_default();
        let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        let mut changes = Vec::new();
        for collection in names {
            let body = new.get(collection);
            if old.get(collection) == body {
                continue;
            }
            changes.push(change(
                path.child(collection)?,
                body.map(|c| Value::Object(c.clone())),
            ));
        }

        match next {
            Some(doc) => {
                docs.insert(name.clone(), doc);
            }
            None => {
                docs.remove(name);
            }
        }
        Ok(Some(changes))
    }

    fn write_direct(
        &self,
        docs: &mut BTreeMap<String, Document>,
        full: &[String],
        value: Option<Value>,
    ) -> Result<Option<Vec<Change>>, StoreError> {
        let path = match full {
            [doc, col] => DocPath::collection(self.scope.clone(), doc.as_str(), col.as_str())?,
            [doc, col, prop] => {
                DocPath::property(self.scope.clone(), doc.as_str(), col.as_str(), prop.as_str())?
            }
            _ => return Err(malformed(full, "not a collection or property path")),
        };
        let (doc, col) = (&full[0], &full[1]);
        let property = path.property_name().map(str::to_string);

        match (value, property) {
            (Some(v), None) => {
                let Value::Object(body) = v else {
                    return Err(malformed(full, "a collection must be an object"));
                };
                docs.entry(doc.clone())
                    .or_default()
                    .insert(col.clone(), body.clone());
                Ok(Some(vec![change(path, Some(Value::Object(body)))]))
            }
            (Some(v), Some(prop)) => {
                docs.entry(doc.clone())
                    .or_default()
                    .entry(col.clone())
                    .or_default()
                    .insert(prop, v.clone());
                Ok(Some(vec![change(path, Some(v))]))
            }
            (None, None) => {
                let removed = docs.get_mut(doc).and_then(|d| d.remove(col));
                Ok(removed.map(|_| vec![change(path, None)]))
            }
            (None, Some(prop)) => {
                let removed = docs
                    .get_mut(doc)
                    .and_then(|d| d.get_mut(col))
                    .and_then(|c| c.remove(&prop));
                Ok(removed.map(|_| vec![change(path, None)]))
            }
        }
    }

    /// Writes below a property rewrite the whole property value.
    fn write_nested(
        &self,
        docs: &mut BTreeMap<String, Document>,
        full: &[String],
        value: Option<Value>,
    ) -> Result<Option<Vec<Change>>, StoreError> {
        let path = DocPath::property(
            self.scope.clone(),
            full[0].as_str(),
            full[1].as_str(),
            full[2].as_str(),
        )?;
        let Some(property) = docs
            .get_mut(&full[0])
            .and_then(|d| d.get_mut(&full[1]))
            .and_then(|c| c.get_mut(&full[2]))
        else {
            return Err(malformed(full, "no such property"));
        };

        let (parents, leaf) = full[3..].split_at(full.len() - 4);
        let mut target: &mut Value = &mut *property;
        for key in parents {
            target = match target.as_object_mut().and_then(|m| m.get_mut(key)) {
                Some(next) => next,
                None => return Err(malformed(full, format!("no object at {key}"))),
            };
        }
        let Some(container) = target.as_object_mut() else {
            return Err(malformed(full, "parent is not an object"));
        };

        let leaf = &leaf[0];
        let changed = match value {
            Some(v) => {
                container.insert(leaf.clone(), v);
                true
            }
            None => container.remove(leaf).is_some(),
        };
        if !changed {
            return Ok(None);
        }
        let whole = property.clone();
        Ok(Some(vec![change(path, Some(whole))]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<StoreEvent>>,
        mutations: Mutex<Vec<Mutation>>,
    }

    impl StoreHooks for Recorder {
        fn notify(&self, event: &StoreEvent) {
            self.events.lock().push(event.clone());
        }
        fn enqueue(&self, mutation: Mutation) {
            self.mutations.lock().push(mutation);
        }
    }

    fn store_with(docs: Value) -> (Store, Arc<Recorder>) {
        let hooks = Arc::new(Recorder::default());
        let Value::Object(map) = docs else {
            panic!("fixture must be an object")
        };
        let documents = map
            .into_iter()
            .map(|(name, doc)| (name.clone(), document_from_value(&[name], doc).unwrap()))
            .collect();
        (
            Store::new(ScopeKey::app_public(), documents, hooks.clone()),
            hooks,
        )
    }

    fn paths(hooks: &Recorder) -> Vec<String> {
        hooks
            .mutations
            .lock()
            .iter()
            .map(|m| format!("{} {}", m.op(), m.path().to_key()))
            .collect()
    }

    #[test]
    fn test_navigate_branches_and_values() {
        let (store, _) =
            store_with(json!({"home": {"settings": {"theme": "dark", "grid": {"cols": 2}}}}));

        let doc = store.get("home").unwrap();
        let settings = doc.as_branch().unwrap().get("settings").unwrap();
        let settings = settings.as_branch().unwrap();
        assert_eq!(settings.keys(), vec!["grid", "theme"]);
        assert_eq!(settings.get("theme").unwrap().as_value(), Some(&json!("dark")));

        let grid = settings.get("grid").unwrap();
        assert_eq!(grid.to_value(), json!({"cols": 2}));
        assert_eq!(
            grid.as_branch().unwrap().get("cols").unwrap().as_value(),
            Some(&json!(2))
        );

        assert!(store.get("missing").is_none());
        assert!(settings.get("missing").is_none());
    }

    #[test]
    fn test_property_set_notifies_and_enqueues() {
        let (store, hooks) = store_with(json!({}));
        store
            .view(&["home", "settings"])
            .set("theme", "light")
            .unwrap();

        assert_eq!(store.collection("home", "settings").unwrap()["theme"], json!("light"));
        let events = hooks.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, MutationOp::Put);
        assert_eq!(events[0].origin, OpSource::Local);
        assert_eq!(events[0].value, Some(json!("light")));
        drop(events);
        assert_eq!(paths(&hooks), vec!["put app:public/home/settings/theme"]);
    }

    #[test]
    fn test_document_replace_decomposes_per_collection() {
        let (store, hooks) =
            store_with(json!({"home": {"a": {"x": 1}, "b": {"y": 1}, "keep": {"z": 0}}}));
        store
            .set("home", json!({"b": {"y": 2}, "c": {}, "keep": {"z": 0}}))
            .unwrap();

        assert_eq!(
            paths(&hooks),
            vec![
                "delete app:public/home/a",
                "put app:public/home/b",
                "put app:public/home/c",
            ]
        );
        assert!(hooks.mutations.lock().iter().all(Mutation::requires_network));
        assert_eq!(hooks.events.lock().len(), 3);
    }

    #[test]
    fn test_document_delete_decomposes_per_collection() {
        let (store, hooks) = store_with(json!({"home": {"a": {"x": 1}, "b": {"y": 1}}}));
        assert!(store.delete("home").unwrap());
        assert!(!store.delete("home").unwrap());
        assert_eq!(
            paths(&hooks),
            vec!["delete app:public/home/a", "delete app:public/home/b"]
        );
        assert!(store.document_names().is_empty());
    }

    #[test]
    fn test_non_object_collection_is_rejected() {
        let (store, hooks) = store_with(json!({}));
        let err = store.view(&["home"]).set("settings", 42).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
        let err = store.set("home", json!({"settings": [1, 2]})).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
        assert!(hooks.events.lock().is_empty());
        assert!(hooks.mutations.lock().is_empty());
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        let (store, _) = store_with(json!({}));
        let err = store.view(&["home"]).set("a/b", json!({})).unwrap_err();
        assert!(matches!(err, StoreError::Key(_)));
    }

    #[test]
    fn test_nested_write_rewrites_property() {
        let (store, hooks) =
            store_with(json!({"home": {"settings": {"grid": {"cols": 2, "rows": 1}}}}));
        let grid = store.view(&["home", "settings", "grid"]);
        grid.set("cols", 3).unwrap();
        assert!(grid.delete("rows").unwrap());
        assert!(!grid.delete("rows").unwrap());

        let mutations = hooks.mutations.lock();
        assert_eq!(mutations.len(), 2);
        assert_eq!(mutations[1].path().property_name(), Some("grid"));
        assert_eq!(mutations[1].value(), Some(&json!({"cols": 3})));
        drop(mutations);

        let err = store
            .view(&["home", "settings", "grid", "cols"])
            .set("deeper", 1)
            .unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[test]
    fn test_evict_is_local_only() {
        let (store, hooks) = store_with(json!({"home": {"a": {"x": 1}}}));
        assert!(store.evict("home").unwrap());
        let mutations = hooks.mutations.lock();
        assert_eq!(mutations.len(), 1);
        assert!(!mutations[0].requires_network());
        assert_eq!(hooks.events.lock().len(), 1);
    }

    #[test]
    fn test_reconcile_reports_previous_value() {
        let (store, hooks) = store_with(json!({"home": {"a": {"x": 1}}}));
        let next: Collection = json!({"x": 2}).as_object().unwrap().clone();

        let previous = store.reconcile("home", "a", Some(next.clone())).unwrap();
        assert_eq!(previous, Some(Some(json!({"x": 1}).as_object().unwrap().clone())));
        assert!(store.reconcile("home", "a", Some(next)).unwrap().is_none());

        let events = hooks.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].origin, OpSource::Remote);
        drop(events);
        assert!(hooks.mutations.lock().is_empty());

        let restored = json!({"x": 2}).as_object().unwrap().clone();
        assert_eq!(
            store.reconcile("home", "a", None).unwrap(),
            Some(Some(restored))
        );
        assert!(store.document_names().is_empty());
    }
}
