//! Key Codec: canonical encoding of scope keys and document paths.
//!
//! Every component compares scopes and paths through these types, so key
//! equality is plain string/tuple equality, never reference identity.
//!
//! # Formats
//!
//! - Scope key: `"{kind}:{scope_id}"`, e.g. `"app:public"`, `"user:3f9a0c…"`.
//!   Parsing splits on the **first** `:`, so scope ids may contain colons.
//! - Path key: ordered segments `[scope_key, document, collection?, property?]`,
//!   displayed as `"app:public/home/settings/theme"`.
//!
//! Names (scope ids, documents, collections, properties) must be non-empty and
//! must not contain `/`, which keeps the displayed form unambiguous.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Separator between kind and scope id in a scope key.
pub const SCOPE_DELIMITER: char = ':';

/// Separator between segments in the displayed form of a path key.
pub const PATH_DELIMITER: char = '/';

/// Errors from parsing or validating keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("scope key '{0}' has no '{SCOPE_DELIMITER}' delimiter")]
    MissingDelimiter(String),
    #[error("unknown scope kind '{0}'")]
    UnknownKind(String),
    #[error("invalid {what} name '{name}'")]
    InvalidName { what: &'static str, name: String },
    #[error("malformed path key '{0}'")]
    MalformedPath(String),
}

/// The kind of data a scope partitions.
#[derive(
    Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    /// Application-wide data (e.g. `app:public`).
    App,
    /// Per-user data, scoped by a user hash.
    User,
}

/// Top-level partition of all stored data: kind + scope identifier.
///
/// Immutable once constructed. Serializes as its delimited string so it can be
/// used directly as a map key and as a wire-protocol field.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScopeKey {
    kind: ScopeKind,
    scope_id: String,
}

impl ScopeKey {
    /// Build a validated scope key.
    pub fn new(kind: ScopeKind, scope_id: impl Into<String>) -> Result<Self, KeyError> {
        let scope_id = scope_id.into();
        check_name("scope id", &scope_id)?;
        Ok(Self { kind, scope_id })
    }

    /// The shared application scope, `app:public`.
    pub fn app_public() -> Self {
        Self {
            kind: ScopeKind::App,
            scope_id: "public".to_string(),
        }
    }

    /// A per-user scope keyed by the user's hash.
    pub fn user(user_hash: impl Into<String>) -> Result<Self, KeyError> {
        Self::new(ScopeKind::User, user_hash)
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    /// The canonical delimited form.
    pub fn encode(&self) -> String {
        make_scope_key(self.kind, &self.scope_id)
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.kind, SCOPE_DELIMITER, self.scope_id)
    }
}

impl FromStr for ScopeKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_scope_key(s)
    }
}

impl TryFrom<String> for ScopeKey {
    type Error = KeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        parse_scope_key(&s)
    }
}

impl From<ScopeKey> for String {
    fn from(key: ScopeKey) -> String {
        key.encode()
    }
}

/// Encode a scope key. Total: never fails, even for ids `parse_scope_key` rejects.
pub fn make_scope_key(kind: ScopeKind, scope_id: &str) -> String {
    format!("{kind}{SCOPE_DELIMITER}{scope_id}")
}

/// Parse `"kind:scope_id"` back into a [`ScopeKey`].
pub fn parse_scope_key(s: &str) -> Result<ScopeKey, KeyError> {
    let (kind, scope_id) = s
        .split_once(SCOPE_DELIMITER)
        .ok_or_else(|| KeyError::MissingDelimiter(s.to_string()))?;
    let kind = ScopeKind::from_str(kind).map_err(|_| KeyError::UnknownKind(kind.to_string()))?;
    ScopeKey::new(kind, scope_id)
}

/// Extract only the kind, stripping any opaque scope id.
///
/// Used for UI grouping where the scope id (a user hash) is irrelevant.
/// Accepts a bare kind (`"user"`) as well as a full key.
pub fn parse_scope_kind(s: &str) -> Option<ScopeKind> {
    let kind = s.split(SCOPE_DELIMITER).next()?;
    ScopeKind::from_str(kind).ok()
}

fn check_name(what: &'static str, name: &str) -> Result<(), KeyError> {
    if name.is_empty() || name.contains(PATH_DELIMITER) {
        return Err(KeyError::InvalidName {
            what,
            name: name.to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Paths
// ============================================================================

/// Structured key for a path: `[scope_key, document, collection?, property?]`.
///
/// Compared by value; serializes as a JSON array of strings.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathKey(Vec<String>);

impl PathKey {
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "{PATH_DELIMITER}")?;
            }
            f.write_str(seg)?;
        }
        Ok(())
    }
}

impl FromStr for PathKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = PathKey(s.split(PATH_DELIMITER).map(str::to_string).collect());
        DocPath::try_from(key.clone())?;
        Ok(key)
    }
}

/// Build the structured key for a path.
///
/// A property without a collection has no address and is dropped.
pub fn path_to_key(
    scope: &ScopeKey,
    document: &str,
    collection: Option<&str>,
    property: Option<&str>,
) -> PathKey {
    let mut segments = vec![scope.encode(), document.to_string()];
    if let Some(collection) = collection {
        segments.push(collection.to_string());
        if let Some(property) = property {
            segments.push(property.to_string());
        }
    }
    PathKey(segments)
}

/// A validated address within a scope.
///
/// Depth 1 names a document, depth 2 a collection, depth 3 a property. A path
/// without a collection is a purely local/UI address and never produces
/// network traffic.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "PathKey", into = "PathKey")]
pub struct DocPath {
    scope: ScopeKey,
    document: String,
    collection: Option<String>,
    property: Option<String>,
}

impl DocPath {
    pub fn document(scope: ScopeKey, document: impl Into<String>) -> Result<Self, KeyError> {
        let document = document.into();
        check_name("document", &document)?;
        Ok(Self {
            scope,
            document,
            collection: None,
            property: None,
        })
    }

    pub fn collection(
        scope: ScopeKey,
        document: impl Into<String>,
        collection: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let mut path = Self::document(scope, document)?;
        let collection = collection.into();
        check_name("collection", &collection)?;
        path.collection = Some(collection);
        Ok(path)
    }

    pub fn property(
        scope: ScopeKey,
        document: impl Into<String>,
        collection: impl Into<String>,
        property: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let mut path = Self::collection(scope, document, collection)?;
        let property = property.into();
        check_name("property", &property)?;
        path.property = Some(property);
        Ok(path)
    }

    /// Extend this path by one segment.
    pub fn child(&self, key: &str) -> Result<Self, KeyError> {
        match (&self.collection, &self.property) {
            (None, _) => Self::collection(self.scope.clone(), self.document.clone(), key),
            (Some(collection), None) => Self::property(
                self.scope.clone(),
                self.document.clone(),
                collection.clone(),
                key,
            ),
            (Some(_), Some(_)) => Err(KeyError::MalformedPath(format!("{}/{key}", self.to_key()))),
        }
    }

    /// The collection-level prefix of this path, if it has one.
    pub fn collection_path(&self) -> Option<Self> {
        self.collection.as_ref().map(|collection| Self {
            scope: self.scope.clone(),
            document: self.document.clone(),
            collection: Some(collection.clone()),
            property: None,
        })
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn document_name(&self) -> &str {
        &self.document
    }

    pub fn collection_name(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn property_name(&self) -> Option<&str> {
        self.property.as_deref()
    }

    /// 1 = document, 2 = collection, 3 = property.
    pub fn depth(&self) -> usize {
        1 + usize::from(self.collection.is_some()) + usize::from(self.property.is_some())
    }

    pub fn has_collection(&self) -> bool {
        self.collection.is_some()
    }

    pub fn to_key(&self) -> PathKey {
        path_to_key(
            &self.scope,
            &self.document,
            self.collection.as_deref(),
            self.property.as_deref(),
        )
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

impl TryFrom<PathKey> for DocPath {
    type Error = KeyError;

    fn try_from(key: PathKey) -> Result<Self, Self::Error> {
        let segs = key.segments();
        match segs {
            [scope, document] => Self::document(parse_scope_key(scope)?, document.clone()),
            [scope, document, collection] => {
                Self::collection(parse_scope_key(scope)?, document.clone(), collection.clone())
            }
            [scope, document, collection, property] => Self::property(
                parse_scope_key(scope)?,
                document.clone(),
                collection.clone(),
                property.clone(),
            ),
            _ => Err(KeyError::MalformedPath(key.to_string())),
        }
    }
}

impl From<DocPath> for PathKey {
    fn from(path: DocPath) -> PathKey {
        path.to_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_and_parse_scope_key() {
        let encoded = make_scope_key(ScopeKind::App, "public");
        assert_eq!(encoded, "app:public");

        let key = parse_scope_key(&encoded).unwrap();
        assert_eq!(key.kind(), ScopeKind::App);
        assert_eq!(key.scope_id(), "public");
        assert_eq!(key, ScopeKey::app_public());
    }

    #[test]
    fn test_scope_id_may_contain_colons() {
        let key = parse_scope_key("user:sha256:ab12").unwrap();
        assert_eq!(key.kind(), ScopeKind::User);
        assert_eq!(key.scope_id(), "sha256:ab12");
        assert_eq!(key.to_string(), "user:sha256:ab12");
    }

    #[test]
    fn test_parse_scope_key_errors() {
        assert_eq!(
            parse_scope_key("public"),
            Err(KeyError::MissingDelimiter("public".into()))
        );
        assert_eq!(
            parse_scope_key("team:alpha"),
            Err(KeyError::UnknownKind("team".into()))
        );
        assert!(matches!(
            parse_scope_key("app:"),
            Err(KeyError::InvalidName { what: "scope id", .. })
        ));
        assert!(parse_scope_key("app:a/b").is_err());
    }

    #[test]
    fn test_parse_scope_kind_strips_scope_id() {
        assert_eq!(parse_scope_kind("user:3f9a0c"), Some(ScopeKind::User));
        assert_eq!(parse_scope_kind("user"), Some(ScopeKind::User));
        assert_eq!(parse_scope_kind("APP:public"), Some(ScopeKind::App));
        assert_eq!(parse_scope_kind("nope:x"), None);
        assert_eq!(parse_scope_kind(""), None);
    }

    #[test]
    fn test_scope_key_serializes_as_string() {
        let key = ScopeKey::user("abc123").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"user:abc123\"");
        let back: ScopeKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<ScopeKey>("\"bogus\"").is_err());
    }

    #[test]
    fn test_path_to_key_segments() {
        let scope = ScopeKey::app_public();
        let key = path_to_key(&scope, "home", Some("settings"), Some("theme"));
        assert_eq!(key.segments(), ["app:public", "home", "settings", "theme"]);
        assert_eq!(key.to_string(), "app:public/home/settings/theme");

        let doc_only = path_to_key(&scope, "home", None, Some("ignored"));
        assert_eq!(doc_only.len(), 2);
    }

    #[test]
    fn test_path_key_equality_is_by_value() {
        let a = path_to_key(&ScopeKey::app_public(), "home", Some("s"), None);
        let b = path_to_key(&parse_scope_key("app:public").unwrap(), "home", Some("s"), None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_path_key_parse() {
        let key: PathKey = "user:u1/home/settings".parse().unwrap();
        let path = DocPath::try_from(key).unwrap();
        assert_eq!(path.depth(), 2);
        assert_eq!(path.collection_name(), Some("settings"));
        assert!("app:public".parse::<PathKey>().is_err());
        assert!("app:public/a/b/c/d".parse::<PathKey>().is_err());
    }

    #[test]
    fn test_doc_path_depth_and_child() {
        let doc = DocPath::document(ScopeKey::app_public(), "home").unwrap();
        assert_eq!(doc.depth(), 1);
        assert!(!doc.has_collection());

        let col = doc.child("settings").unwrap();
        assert_eq!(col.depth(), 2);
        let prop = col.child("theme").unwrap();
        assert_eq!(prop.depth(), 3);
        assert_eq!(prop.collection_path(), Some(col));
        assert!(prop.child("deeper").is_err());
    }

    #[test]
    fn test_doc_path_rejects_bad_names() {
        let scope = ScopeKey::app_public();
        assert!(DocPath::document(scope.clone(), "").is_err());
        assert!(DocPath::collection(scope.clone(), "home", "a/b").is_err());
        assert!(DocPath::property(scope, "home", "settings", "").is_err());
    }

    #[test]
    fn test_doc_path_serializes_as_array() {
        let path = DocPath::property(ScopeKey::app_public(), "home", "settings", "theme").unwrap();
        let json = serde_json::to_value(&path).unwrap();
        assert_eq!(
            json,
            serde_json::json!(["app:public", "home", "settings", "theme"])
        );
        let back: DocPath = serde_json::from_value(json).unwrap();
        assert_eq!(back, path);
    }
}
