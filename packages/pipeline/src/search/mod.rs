//! Searchable projection of the artifact record.
//!
//! Documents are primary-keyed by `invite_code` and written via partial
//! upserts: each stage sends only the fields it knows, and empty strings
//! are stripped from update payloads so an enricher pass can never blank
//! out a field another pass filled in.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::MeilisearchConfig;

/// Full search document shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchDoc {
    pub invite_code: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub icon_url: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub member_count: i64,
    #[serde(default)]
    pub timestamp_formatted: String,
}

/// Partial update payload. Only `Some` fields are serialized; string
/// fields holding empty values are dropped by [`SearchDocPatch::normalized`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchDocPatch {
    pub invite_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_formatted: Option<String>,
}

impl SearchDocPatch {
    pub fn new(invite_code: impl Into<String>) -> Self {
        Self {
            invite_code: invite_code.into(),
            ..Default::default()
        }
    }

    pub fn server_name(mut self, value: impl Into<String>) -> Self {
        self.server_name = Some(value.into());
        self
    }

    pub fn icon_url(mut self, value: impl Into<String>) -> Self {
        self.icon_url = Some(value.into());
        self
    }

    pub fn source_url(mut self, value: impl Into<String>) -> Self {
        self.source_url = Some(value.into());
        self
    }

    pub fn status(mut self, value: impl Into<String>) -> Self {
        self.status = Some(value.into());
        self
    }

    pub fn member_count(mut self, value: i64) -> Self {
        self.member_count = Some(value);
        self
    }

    pub fn timestamp_formatted(mut self, value: impl Into<String>) -> Self {
        self.timestamp_formatted = Some(value.into());
        self
    }

    /// Drops empty string fields so they never overwrite indexed values.
    pub fn normalized(mut self) -> Self {
        fn keep(field: &mut Option<String>) {
            if field.as_deref() == Some("") {
                *field = None;
            }
        }
        keep(&mut self.server_name);
        keep(&mut self.icon_url);
        keep(&mut self.source_url);
        keep(&mut self.status);
        keep(&mut self.timestamp_formatted);
        self
    }
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Creates the index and its settings if missing. Idempotent.
    async fn ensure(&self) -> Result<()>;

    /// Partial insert-or-update keyed by `invite_code`.
    async fn upsert(&self, patch: SearchDocPatch) -> Result<()>;

    async fn get(&self, invite_code: &str) -> Result<Option<SearchDoc>>;
}

const SEARCHABLE: &[&str] = &["server_name", "invite_code", "source_url", "status"];
const FILTERABLE: &[&str] = &["member_count", "status"];
const SORTABLE: &[&str] = &["member_count", "status"];

/// Meilisearch over its plain HTTP API.
pub struct MeiliIndexer {
    http: reqwest::Client,
    host: String,
    key: String,
    index: String,
}

impl MeiliIndexer {
    pub fn new(cfg: &MeilisearchConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            host: cfg.host.trim_end_matches('/').to_string(),
            key: cfg.key.clone(),
            index: cfg.index.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.host, path));
        if !self.key.is_empty() {
            builder = builder.bearer_auth(&self.key);
        }
        builder
    }
}

#[async_trait]
impl SearchIndex for MeiliIndexer {
    async fn ensure(&self) -> Result<()> {
        // Index creation is async on the server side; an already-existing
        // index surfaces as a failed task, which is fine here.
        let response = self
            .request(reqwest::Method::POST, "/indexes")
            .json(&serde_json::json!({ "uid": self.index, "primaryKey": "invite_code" }))
            .send()
            .await
            .context("creating search index")?;
        debug!(status = %response.status(), index = %self.index, "index create requested");

        for (path, attrs) in [
            ("searchable-attributes", SEARCHABLE),
            ("filterable-attributes", FILTERABLE),
            ("sortable-attributes", SORTABLE),
        ] {
            self.request(
                reqwest::Method::PUT,
                &format!("/indexes/{}/settings/{}", self.index, path),
            )
            .json(&attrs)
            .send()
            .await
            .with_context(|| format!("updating index settings: {path}"))?
            .error_for_status()
            .with_context(|| format!("index settings rejected: {path}"))?;
        }

        info!(index = %self.index, "search index ensured");
        Ok(())
    }

    async fn upsert(&self, patch: SearchDocPatch) -> Result<()> {
        let patch = patch.normalized();
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/indexes/{}/documents", self.index),
            )
            .json(&[&patch])
            .send()
            .await
            .context("upserting search document")?;
        response
            .error_for_status()
            .context("search upsert rejected")?;
        Ok(())
    }

    async fn get(&self, invite_code: &str) -> Result<Option<SearchDoc>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/indexes/{}/documents/{}", self.index, invite_code),
            )
            .send()
            .await
            .context("fetching search document")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc: SearchDoc = response
            .error_for_status()
            .context("search get rejected")?
            .json()
            .await
            .context("decoding search document")?;
        Ok(Some(doc))
    }
}

/// In-memory index with the same partial-merge semantics, for tests.
#[derive(Default)]
pub struct MemorySearchIndex {
    docs: Mutex<HashMap<String, SearchDoc>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn docs(&self) -> Vec<SearchDoc> {
        self.docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Pre-seeds a document, for skip-if-enriched tests.
    pub fn seed(&self, doc: SearchDoc) {
        self.docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc.invite_code.clone(), doc);
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn ensure(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, patch: SearchDocPatch) -> Result<()> {
        let patch = patch.normalized();
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        let doc = docs
            .entry(patch.invite_code.clone())
            .or_insert_with(|| SearchDoc {
                invite_code: patch.invite_code.clone(),
                ..Default::default()
            });

        if let Some(v) = patch.server_name {
            doc.server_name = v;
        }
        if let Some(v) = patch.icon_url {
            doc.icon_url = v;
        }
        if let Some(v) = patch.source_url {
            doc.source_url = v;
        }
        if let Some(v) = patch.status {
            doc.status = v;
        }
        if let Some(v) = patch.member_count {
            doc.member_count = v;
        }
        if let Some(v) = patch.timestamp_formatted {
            doc.timestamp_formatted = v;
        }
        Ok(())
    }

    async fn get(&self, invite_code: &str) -> Result<Option<SearchDoc>> {
        Ok(self
            .docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(invite_code)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_drops_empty_strings_but_keeps_zero_count() {
        let patch = SearchDocPatch::new("abc")
            .server_name("")
            .icon_url("")
            .status("expired")
            .member_count(0)
            .normalized();

        assert!(patch.server_name.is_none());
        assert!(patch.icon_url.is_none());
        assert_eq!(patch.status.as_deref(), Some("expired"));
        assert_eq!(patch.member_count, Some(0));

        let json = serde_json::to_value(&patch).unwrap();
        assert!(json.get("server_name").is_none());
        assert_eq!(json["status"], "expired");
        assert_eq!(json["member_count"], 0);
    }

    #[tokio::test]
    async fn partial_update_never_blanks_existing_fields() {
        let index = MemorySearchIndex::new();
        index
            .upsert(
                SearchDocPatch::new("abc")
                    .server_name("Alpha")
                    .icon_url("https://cdn/icon.png")
                    .status("active"),
            )
            .await
            .unwrap();

        // A later pass that knows nothing about the server fields.
        index
            .upsert(SearchDocPatch::new("abc").server_name("").status("expired"))
            .await
            .unwrap();

        let doc = index.get("abc").await.unwrap().unwrap();
        assert_eq!(doc.server_name, "Alpha");
        assert_eq!(doc.icon_url, "https://cdn/icon.png");
        assert_eq!(doc.status, "expired");
    }

    #[tokio::test]
    async fn upsert_creates_then_merges() {
        let index = MemorySearchIndex::new();
        index
            .upsert(
                SearchDocPatch::new("abc")
                    .source_url("https://x/@u/video/1")
                    .status("pending")
                    .timestamp_formatted("01/01/2026 12:00:00"),
            )
            .await
            .unwrap();
        index
            .upsert(
                SearchDocPatch::new("abc")
                    .server_name("Alpha")
                    .member_count(42)
                    .status("active"),
            )
            .await
            .unwrap();

        let doc = index.get("abc").await.unwrap().unwrap();
        assert_eq!(doc.source_url, "https://x/@u/video/1");
        assert_eq!(doc.server_name, "Alpha");
        assert_eq!(doc.member_count, 42);
        assert_eq!(doc.status, "active");
        assert_eq!(index.docs().len(), 1);
    }
}
