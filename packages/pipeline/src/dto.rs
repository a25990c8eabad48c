//! Wire payloads exchanged over the bus.
//!
//! Field names are the on-wire contract shared with every other consumer
//! of these subjects; do not rename without versioning the subject.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job published by discovery, consumed by scrape workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub video_id: String,
    pub video_url: String,
    pub hashtag: String,
}

/// One captured comment. Replies carry a `[reply]` text prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawComment {
    pub handle: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    #[serde(default)]
    pub comments: Vec<RawComment>,
    #[serde(default)]
    pub hashtag: String,
    #[serde(default)]
    pub video_id: String,
}

/// Text artifact published by the scrape worker, consumed by fast ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactPayload {
    pub source_path: String,
    pub text_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(default)]
    pub source_type: String,
    #[serde(default)]
    pub metadata: ArtifactMetadata,
}

/// Enrichment job keyed by the invite code alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteEnrichJob {
    pub invite_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMetadata {
    pub num_delivered: i64,
    pub timestamp: DateTime<Utc>,
}

/// Record published to `argus.dlq.<stage>` when a message exhausts its
/// retry budget. `job` holds the original payload verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    pub error: String,
    pub job: serde_json::Value,
    pub metadata: DlqMetadata,
}
