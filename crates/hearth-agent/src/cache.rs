//! SQLite persistent cache shared by every page context and the agent.
//!
//! Collections are stored whole as JSON objects keyed by
//! `(scope, document, collection)`; a secondary index on `(scope, document)`
//! serves whole-document iteration and delete. The cache also remembers the
//! last remote version per document, which scopes have loaded, each page's
//! request seed, and batch-updates the remote has not yet acknowledged.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use thiserror::Error;

use hearth_types::{
    Collection, Document, Mutation, MutationError, MutationOp, PageId, RequestSeed, ScopeKey,
    parse_scope_key,
};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error("corrupt cache row: {0}")]
    Corrupt(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Handle shared between the agent and every page engine.
pub type SharedCache = Arc<Mutex<CacheDb>>;

/// A batch-update persisted until the remote acknowledges it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub id: i64,
    pub scope: ScopeKey,
    pub document: String,
    pub collection: String,
    pub property: Option<String>,
    pub op: MutationOp,
}

const SCHEMA: &str = r#"
-- Collection bodies (JSON object per row)
CREATE TABLE IF NOT EXISTS collections (
    scope TEXT NOT NULL,
    document TEXT NOT NULL,
    collection TEXT NOT NULL,
    properties TEXT NOT NULL,
    updated_at INTEGER DEFAULT (unixepoch()),
    PRIMARY KEY (scope, document, collection)
);
CREATE INDEX IF NOT EXISTS idx_collections_document ON collections(scope, document);

-- Last version the remote returned per document
CREATE TABLE IF NOT EXISTS versions (
    scope TEXT NOT NULL,
    document TEXT NOT NULL,
    version INTEGER NOT NULL,
    PRIMARY KEY (scope, document)
);

-- Scopes whose initial data has arrived
CREATE TABLE IF NOT EXISTS loaded_scopes (
    scope TEXT PRIMARY KEY,
    loaded_at INTEGER DEFAULT (unixepoch())
);

-- Request seeds, one per page
CREATE TABLE IF NOT EXISTS seeds (
    page TEXT PRIMARY KEY,
    seed TEXT NOT NULL
);

-- Batch-updates awaiting remote acknowledgement
CREATE TABLE IF NOT EXISTS pending (
    id INTEGER PRIMARY KEY,
    scope TEXT NOT NULL,
    document TEXT NOT NULL,
    collection TEXT NOT NULL,
    property TEXT,
    op TEXT NOT NULL,
    created_at INTEGER DEFAULT (unixepoch())
);
"#;

/// Database handle for the persistent cache.
pub struct CacheDb {
    conn: Connection,
}

impl CacheDb {
    /// Open or create a cache at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Create an in-memory cache (for testing).
    pub fn in_memory() -> CacheResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn into_shared(self) -> SharedCache {
        Arc::new(Mutex::new(self))
    }

    // =========================================================================
    // Collections
    // =========================================================================

    pub fn get(
        &self,
        scope: &ScopeKey,
        document: &str,
        collection: &str,
    ) -> CacheResult<Option<Collection>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT properties FROM collections
                 WHERE scope = ?1 AND document = ?2 AND collection = ?3",
                params![scope.encode(), document, collection],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|s| decode_collection(&s)).transpose()
    }

    pub fn put(
        &self,
        scope: &ScopeKey,
        document: &str,
        collection: &str,
        properties: &Collection,
    ) -> CacheResult<()> {
        let body = serde_json::to_string(properties)?;
        self.conn.execute(
            "INSERT INTO collections (scope, document, collection, properties)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scope, document, collection)
             DO UPDATE SET properties = excluded.properties, updated_at = unixepoch()",
            params![scope.encode(), document, collection, body],
        )?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete_collection(
        &self,
        scope: &ScopeKey,
        document: &str,
        collection: &str,
    ) -> CacheResult<bool> {
        let n = self.conn.execute(
            "DELETE FROM collections WHERE scope = ?1 AND document = ?2 AND collection = ?3",
            params![scope.encode(), document, collection],
        )?;
        Ok(n > 0)
    }

    /// Delete every collection of a document. Returns the removed names.
    pub fn delete_document(&self, scope: &ScopeKey, document: &str) -> CacheResult<Vec<String>> {
        let names = self.collection_names(scope, document)?;
        self.conn.execute(
            "DELETE FROM collections WHERE scope = ?1 AND document = ?2",
            params![scope.encode(), document],
        )?;
        Ok(names)
    }

    pub fn collection_names(&self, scope: &ScopeKey, document: &str) -> CacheResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT collection FROM collections
             WHERE scope = ?1 AND document = ?2 ORDER BY collection",
        )?;
        let rows = stmt.query_map(params![scope.encode(), document], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    /// All collections of a document.
    pub fn document(&self, scope: &ScopeKey, document: &str) -> CacheResult<Document> {
        let mut stmt = self.conn.prepare(
            "SELECT collection, properties FROM collections
             WHERE scope = ?1 AND document = ?2",
        )?;
        let rows = stmt.query_map(params![scope.encode(), document], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut doc = Document::new();
        for row in rows {
            let (name, body) = row?;
            doc.insert(name, decode_collection(&body)?);
        }
        Ok(doc)
    }

    /// Names of every document cached under a scope.
    pub fn scope_documents(&self, scope: &ScopeKey) -> CacheResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT document FROM collections WHERE scope = ?1 ORDER BY document",
        )?;
        let rows = stmt.query_map(params![scope.encode()], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    /// Apply a mutation, writing only if the result differs from what is cached.
    ///
    /// Returns whether anything changed. Document-level puts replace the whole
    /// document and require an object of objects.
    pub fn apply(&self, mutation: &Mutation) -> CacheResult<bool> {
        let path = mutation.path();
        let scope = path.scope();
        let document = path.document_name();

        let Some(collection) = path.collection_name() else {
            return self.apply_document(mutation);
        };

        let current = self.get(scope, document, collection)?;
        let next = mutation.collection_after(current.as_ref())?;
        if next == current {
            return Ok(false);
        }
        match next {
            Some(body) => self.put(scope, document, collection, &body)?,
            None => {
                self.delete_collection(scope, document, collection)?;
            }
        }
        Ok(true)
    }

    fn apply_document(&self, mutation: &Mutation) -> CacheResult<bool> {
        let path = mutation.path();
        let scope = path.scope();
        let document = path.document_name();
        let current = self.document(scope, document)?;

        let next = match mutation {
            Mutation::Delete { .. } => Document::new(),
            Mutation::Put { value, .. } => document_from_value(value)
                .ok_or_else(|| MutationError::NotAnObject(path.clone()))?,
        };
        if next == current {
            return Ok(false);
        }

        let tx = self.conn.unchecked_transaction()?;
        self.delete_document(scope, document)?;
        for (name, body) in &next {
            self.put(scope, document, name, body)?;
        }
        tx.commit()?;
        Ok(true)
    }

    // =========================================================================
    // Versions and load state
    // =========================================================================

    pub fn version(&self, scope: &ScopeKey, document: &str) -> CacheResult<Option<u64>> {
        let v: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM versions WHERE scope = ?1 AND document = ?2",
                params![scope.encode(), document],
                |row| row.get(0),
            )
            .optional()?;
        Ok(v.map(|v| v as u64))
    }

    /// Record the version the remote returned. Only remote responses call this.
    pub fn set_version(&self, scope: &ScopeKey, document: &str, version: u64) -> CacheResult<()> {
        self.conn.execute(
            "INSERT INTO versions (scope, document, version) VALUES (?1, ?2, ?3)
             ON CONFLICT(scope, document) DO UPDATE SET version = excluded.version",
            params![scope.encode(), document, version as i64],
        )?;
        Ok(())
    }

    pub fn mark_loaded(&self, scope: &ScopeKey) -> CacheResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO loaded_scopes (scope) VALUES (?1)",
            params![scope.encode()],
        )?;
        Ok(())
    }

    pub fn is_loaded(&self, scope: &ScopeKey) -> CacheResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM loaded_scopes WHERE scope = ?1",
            params![scope.encode()],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Drop cached data, versions and the loaded marker for a scope.
    ///
    /// Pending writes survive so they can still be replayed.
    pub fn purge_scope(&self, scope: &ScopeKey) -> CacheResult<()> {
        let key = scope.encode();
        let tx = self.conn.unchecked_transaction()?;
        self.conn
            .execute("DELETE FROM collections WHERE scope = ?1", params![key])?;
        self.conn
            .execute("DELETE FROM versions WHERE scope = ?1", params![key])?;
        self.conn
            .execute("DELETE FROM loaded_scopes WHERE scope = ?1", params![key])?;
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Request seeds
    // =========================================================================

    pub fn load_seed(&self, page: PageId) -> CacheResult<Option<RequestSeed>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT seed FROM seeds WHERE page = ?1",
                params![page.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    pub fn save_seed(&self, seed: &RequestSeed) -> CacheResult<()> {
        let body = serde_json::to_string(seed)?;
        self.conn.execute(
            "INSERT INTO seeds (page, seed) VALUES (?1, ?2)
             ON CONFLICT(page) DO UPDATE SET seed = excluded.seed",
            params![seed.page.to_string(), body],
        )?;
        Ok(())
    }

    // =========================================================================
    // Pending batch-updates
    // =========================================================================

    pub fn push_pending(
        &self,
        scope: &ScopeKey,
        document: &str,
        collection: &str,
        property: Option<&str>,
        op: MutationOp,
    ) -> CacheResult<i64> {
        self.conn.execute(
            "INSERT INTO pending (scope, document, collection, property, op)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![scope.encode(), document, collection, property, op.to_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All pending writes in arrival order.
    pub fn pending(&self) -> CacheResult<Vec<PendingWrite>> {
        self.select_pending(
            "SELECT id, scope, document, collection, property, op FROM pending ORDER BY id",
            params![],
        )
    }

    /// Pending writes of one document in arrival order.
    pub fn document_pending(
        &self,
        scope: &ScopeKey,
        document: &str,
    ) -> CacheResult<Vec<PendingWrite>> {
        self.select_pending(
            "SELECT id, scope, document, collection, property, op FROM pending
             WHERE scope = ?1 AND document = ?2 ORDER BY id",
            params![scope.encode(), document],
        )
    }

    /// Documents with pending writes, oldest write first.
    pub fn pending_documents(&self) -> CacheResult<Vec<(ScopeKey, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT scope, document FROM pending
             GROUP BY scope, document ORDER BY MIN(id)",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (scope, document) = row?;
            let scope =
                parse_scope_key(&scope).map_err(|e| CacheError::Corrupt(e.to_string()))?;
            out.push((scope, document));
        }
        Ok(out)
    }

    fn select_pending<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> CacheResult<Vec<PendingWrite>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, scope, document, collection, property, op) = row?;
            let scope =
                parse_scope_key(&scope).map_err(|e| CacheError::Corrupt(e.to_string()))?;
            let op = op
                .parse::<MutationOp>()
                .map_err(|_| CacheError::Corrupt(format!("pending op '{op}'")))?;
            out.push(PendingWrite {
                id,
                scope,
                document,
                collection,
                property,
                op,
            });
        }
        Ok(out)
    }

    /// Collections of a document with unacknowledged writes.
    pub fn pending_collections(
        &self,
        scope: &ScopeKey,
        document: &str,
    ) -> CacheResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT collection FROM pending
             WHERE scope = ?1 AND document = ?2 ORDER BY collection",
        )?;
        let rows = stmt.query_map(params![scope.encode(), document], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    pub fn remove_pending(&self, id: i64) -> CacheResult<()> {
        self.conn
            .execute("DELETE FROM pending WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn pending_count(&self) -> CacheResult<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn decode_collection(body: &str) -> CacheResult<Collection> {
    match serde_json::from_str::<Value>(body)? {
        Value::Object(map) => Ok(map),
        other => Err(CacheError::Corrupt(format!(
            "collection body is not an object: {other}"
        ))),
    }
}

fn document_from_value(value: &Value) -> Option<Document> {
    let Value::Object(map) = value else {
        return None;
    };
    map.iter()
        .map(|(name, body)| match body {
            Value::Object(c) => Some((name.clone(), c.clone())),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_types::{DocPath, RequestSeedEntry};
    use serde_json::json;

    fn scope() -> ScopeKey {
        ScopeKey::app_public()
    }

    fn obj(v: Value) -> Collection {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn prop(p: &str) -> DocPath {
        DocPath::property(scope(), "home", "settings", p).unwrap()
    }

    #[test]
    fn test_collection_crud() {
        let db = CacheDb::in_memory().unwrap();
        assert_eq!(db.get(&scope(), "home", "settings").unwrap(), None);

        db.put(&scope(), "home", "settings", &obj(json!({"theme": "dark"})))
            .unwrap();
        db.put(&scope(), "home", "layout", &obj(json!({"cols": 2})))
            .unwrap();
        assert_eq!(
            db.get(&scope(), "home", "settings").unwrap(),
            Some(obj(json!({"theme": "dark"})))
        );
        assert_eq!(db.scope_documents(&scope()).unwrap(), vec!["home"]);

        assert!(db.delete_collection(&scope(), "home", "layout").unwrap());
        assert!(!db.delete_collection(&scope(), "home", "layout").unwrap());
        assert_eq!(db.document(&scope(), "home").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_document_uses_index_and_reports_names() {
        let db = CacheDb::in_memory().unwrap();
        db.put(&scope(), "home", "a", &Collection::new()).unwrap();
        db.put(&scope(), "home", "b", &Collection::new()).unwrap();
        db.put(&scope(), "other", "a", &Collection::new()).unwrap();

        let removed = db.delete_document(&scope(), "home").unwrap();
        assert_eq!(removed, vec!["a", "b"]);
        assert!(db.document(&scope(), "home").unwrap().is_empty());
        assert_eq!(db.document(&scope(), "other").unwrap().len(), 1);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let db = CacheDb::in_memory().unwrap();
        let m = Mutation::put(prop("theme"), json!("dark"));
        assert!(db.apply(&m).unwrap());
        assert!(!db.apply(&m).unwrap());

        let del = Mutation::delete(prop("theme"));
        assert!(db.apply(&del).unwrap());
        assert!(!db.apply(&del).unwrap());
    }

    #[test]
    fn test_apply_collection_replace_and_delete() {
        let db = CacheDb::in_memory().unwrap();
        let col = DocPath::collection(scope(), "home", "settings").unwrap();
        assert!(db.apply(&Mutation::put(col.clone(), json!({"a": 1}))).unwrap());
        assert!(!db.apply(&Mutation::put(col.clone(), json!({"a": 1}))).unwrap());
        assert!(db.apply(&Mutation::delete(col.clone())).unwrap());
        assert_eq!(db.get(&scope(), "home", "settings").unwrap(), None);
        assert!(!db.apply(&Mutation::delete(col)).unwrap());
    }

    #[test]
    fn test_apply_document_level() {
        let db = CacheDb::in_memory().unwrap();
        db.put(&scope(), "home", "old", &obj(json!({"x": 1}))).unwrap();
        let doc = DocPath::document(scope(), "home").unwrap();

        let put = Mutation::put(doc.clone(), json!({"a": {"k": 1}, "b": {}}));
        assert!(db.apply(&put).unwrap());
        assert!(!db.apply(&put).unwrap());
        assert_eq!(db.collection_names(&scope(), "home").unwrap(), vec!["a", "b"]);

        assert!(db.apply(&Mutation::put(doc.clone(), json!({"a": 1}))).is_err());

        assert!(db.apply(&Mutation::delete(doc)).unwrap());
        assert!(db.document(&scope(), "home").unwrap().is_empty());
    }

    #[test]
    fn test_versions_and_loaded() {
        let db = CacheDb::in_memory().unwrap();
        assert_eq!(db.version(&scope(), "home").unwrap(), None);
        db.set_version(&scope(), "home", 3).unwrap();
        db.set_version(&scope(), "home", 4).unwrap();
        assert_eq!(db.version(&scope(), "home").unwrap(), Some(4));

        assert!(!db.is_loaded(&scope()).unwrap());
        db.mark_loaded(&scope()).unwrap();
        db.mark_loaded(&scope()).unwrap();
        assert!(db.is_loaded(&scope()).unwrap());
    }

    #[test]
    fn test_purge_scope_keeps_pending() {
        let db = CacheDb::in_memory().unwrap();
        let user = ScopeKey::user("u1").unwrap();
        db.put(&user, "home", "s", &Collection::new()).unwrap();
        db.put(&scope(), "home", "s", &Collection::new()).unwrap();
        db.set_version(&user, "home", 2).unwrap();
        db.mark_loaded(&user).unwrap();
        db.push_pending(&user, "home", "s", None, MutationOp::Put)
            .unwrap();

        db.purge_scope(&user).unwrap();
        assert!(db.scope_documents(&user).unwrap().is_empty());
        assert_eq!(db.version(&user, "home").unwrap(), None);
        assert!(!db.is_loaded(&user).unwrap());
        assert_eq!(db.pending_count().unwrap(), 1);
        assert_eq!(db.scope_documents(&scope()).unwrap(), vec!["home"]);
    }

    #[test]
    fn test_seed_persistence() {
        let db = CacheDb::in_memory().unwrap();
        let page = PageId::new();
        assert_eq!(db.load_seed(page).unwrap(), None);

        let mut seed = RequestSeed::new(page);
        seed.entries
            .push(RequestSeedEntry::new(scope(), "home", vec!["settings".into()]));
        db.save_seed(&seed).unwrap();
        assert_eq!(db.load_seed(page).unwrap(), Some(seed));
    }

    #[test]
    fn test_pending_roundtrip_in_order() {
        let db = CacheDb::in_memory().unwrap();
        let a = db
            .push_pending(&scope(), "home", "settings", Some("theme"), MutationOp::Put)
            .unwrap();
        let b = db
            .push_pending(&scope(), "home", "settings", None, MutationOp::Delete)
            .unwrap();

        let rows = db.pending().unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(rows[0].property.as_deref(), Some("theme"));
        assert_eq!(rows[1].op, MutationOp::Delete);

        assert_eq!(db.pending_collections(&scope(), "home").unwrap(), vec!["settings"]);
        assert!(db.pending_collections(&scope(), "other").unwrap().is_empty());

        db.remove_pending(a).unwrap();
        assert_eq!(db.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_pending_grouped_by_document() {
        let db = CacheDb::in_memory().unwrap();
        let user = ScopeKey::user("u1").unwrap();
        db.push_pending(&user, "prefs", "ui", Some("zoom"), MutationOp::Put)
            .unwrap();
        db.push_pending(&scope(), "home", "settings", Some("a"), MutationOp::Put)
            .unwrap();
        db.push_pending(&user, "prefs", "ui", Some("dock"), MutationOp::Delete)
            .unwrap();

        assert_eq!(
            db.pending_documents().unwrap(),
            vec![(user.clone(), "prefs".to_string()), (scope(), "home".to_string())]
        );
        let rows = db.document_pending(&user, "prefs").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].property.as_deref(), Some("zoom"));
        assert_eq!(rows[1].op, MutationOp::Delete);
        assert!(db.document_pending(&scope(), "other").unwrap().is_empty());
    }

    #[test]
    fn test_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let db = CacheDb::open(&path).unwrap();
            db.put(&scope(), "home", "settings", &obj(json!({"a": 1})))
                .unwrap();
            db.mark_loaded(&scope()).unwrap();
        }
        let db = CacheDb::open(&path).unwrap();
        assert!(db.is_loaded(&scope()).unwrap());
        assert_eq!(
            db.get(&scope(), "home", "settings").unwrap(),
            Some(obj(json!({"a": 1})))
        );
    }
}
