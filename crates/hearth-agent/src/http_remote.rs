//! HTTP client for the remote data API.
//!
//! - `GET  /data/{scope}/{document}` → `{"__version": n, "<collection>": {...}, ...}`
//! - `GET  /data/{scope}/{document}/{collection}` → `{"__version": n, "<property>": ..., ...}`
//! - `POST /data/{scope}/{document}` (put) and `DELETE /data/{scope}/{document}`
//!   (delete) with a [`MutationRequest`] body → `{"newVersion": n, "conflict"?: bool}`
//!
//! A `409` response is the version-conflict indicator: the server merged and the
//! body still carries the new version.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, warn};

use hearth_types::{Document, MutationOp, ScopeKey};

use crate::constants::HTTP_TIMEOUT;
use crate::remote::{MutationOutcome, MutationRequest, RemoteDocument, RemoteError, RemoteStore};

const VERSION_FIELD: &str = "__version";

pub struct HttpRemote {
    client: reqwest::Client,
    base: Url,
}

impl HttpRemote {
    pub fn new(base_url: &str) -> Result<Self, RemoteError> {
        Self::with_timeout(base_url, HTTP_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let base = Url::parse(base_url)
            .map_err(|e| RemoteError::Decode(format!("bad base url {base_url}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        Ok(Self { client, base })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Decode(format!("base url {} cannot hold a path", self.base)))?
            .pop_if_empty()
            .push("data")
            .extend(segments);
        Ok(url)
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_decode() {
        RemoteError::Decode(e.to_string())
    } else {
        RemoteError::Unavailable(e.to_string())
    }
}

async fn rejected(resp: reqwest::Response) -> RemoteError {
    let status = resp.status().as_u16();
    let message = resp.text().await.unwrap_or_default();
    RemoteError::Rejected { status, message }
}

fn split_version(body: Value) -> Result<(u64, serde_json::Map<String, Value>), RemoteError> {
    let Value::Object(mut map) = body else {
        return Err(RemoteError::Decode("expected a JSON object".into()));
    };
    let version = match map.remove(VERSION_FIELD) {
        Some(v) => v
            .as_u64()
            .ok_or_else(|| RemoteError::Decode(format!("{VERSION_FIELD} is not an integer")))?,
        None => 0,
    };
    Ok((version, map))
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn fetch(
        &self,
        scope: &ScopeKey,
        document: &str,
        collection: Option<&str>,
    ) -> Result<RemoteDocument, RemoteError> {
        let scope_key = scope.encode();
        let mut segments = vec![scope_key.as_str(), document];
        segments.extend(collection);
        let url = self.url(&segments)?;

        let resp = self.client.get(url).send().await.map_err(transport_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(scope = %scope, document, "remote has no such document");
            return Ok(RemoteDocument::default());
        }
        if !resp.status().is_success() {
            return Err(rejected(resp).await);
        }
        let body: Value = resp.json().await.map_err(transport_error)?;
        let (version, fields) = split_version(body)?;

        let mut collections = Document::new();
        match collection {
            Some(name) => {
                collections.insert(name.to_string(), fields);
            }
            None => {
                for (name, body) in fields {
                    match body {
                        Value::Object(props) => {
                            collections.insert(name, props);
                        }
                        other => {
                            warn!(collection = %name, value = %other, "skipping non-object")
                        }
                    }
                }
            }
        }
        Ok(RemoteDocument {
            version,
            collections,
        })
    }

    async fn mutate(
        &self,
        scope: &ScopeKey,
        document: &str,
        request: MutationRequest,
    ) -> Result<MutationOutcome, RemoteError> {
        let scope_key = scope.encode();
        let url = self.url(&[scope_key.as_str(), document])?;
        let method = match request.op {
            MutationOp::Put => Method::POST,
            MutationOp::Delete => Method::DELETE,
        };

        let resp = self
            .client
            .request(method, url)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status == StatusCode::CONFLICT {
            let outcome: MutationOutcome = resp.json().await.map_err(transport_error)?;
            return Ok(MutationOutcome {
                conflict: true,
                ..outcome
            });
        }
        if !status.is_success() {
            return Err(rejected(resp).await);
        }
        resp.json().await.map_err(transport_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_encodes_segments() {
        let remote = HttpRemote::new("http://localhost:8080/api/").unwrap();
        let url = remote.url(&["user:a b", "home"]).unwrap();
        assert_eq!(url.path(), "/api/data/user:a%20b/home");
    }

    #[test]
    fn test_split_version() {
        let (v, rest) = split_version(serde_json::json!({"__version": 4, "a": {}})).unwrap();
        assert_eq!(v, 4);
        assert!(rest.contains_key("a"));
        assert!(split_version(serde_json::json!([1])).is_err());
    }
}
