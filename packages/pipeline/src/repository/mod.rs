//! Canonical artifact storage.
//!
//! One row per `(source_url, invite_code)` pair. Fast ingestion creates
//! shallow rows (`status=pending`); the enricher later fills the server
//! fields through a narrow update that never touches `raw_text`.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

/// Delimiter between texts when the same post/invite pair is seen again.
pub const RAW_TEXT_DELIMITER: &str = "\n---\n";

/// Shallow row written by fast ingestion.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub source_url: String,
    pub author_id: String,
    pub invite_code: String,
    pub raw_text: String,
    pub risk_score: i32,
}

/// Enrichment columns written by the enricher.
#[derive(Debug, Clone)]
pub struct Enrichment {
    pub server_name: String,
    pub server_id: String,
    pub server_icon_url: String,
    pub member_count: i64,
    pub status: String,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Insert-or-update keyed by `(source_url, invite_code)`. On conflict
    /// the new `raw_text` is appended after [`RAW_TEXT_DELIMITER`]; rows
    /// are never deleted by the pipeline.
    async fn upsert_shallow(&self, artifact: NewArtifact) -> Result<Uuid>;

    /// Narrow update of the enrichment columns for every row carrying the
    /// invite code. Returns the number of rows touched.
    async fn update_enriched(&self, invite_code: &str, enrichment: &Enrichment) -> Result<u64>;

    /// Terminal negative result: only flips `status` to `expired`.
    async fn mark_expired(&self, invite_code: &str) -> Result<u64>;
}

pub struct PostgresArtifactStore {
    pool: PgPool,
}

impl PostgresArtifactStore {
    /// Connects and reconciles the schema. Failure is fatal at startup.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;

        let store = Self { pool };
        store.reconcile_schema().await?;
        Ok(store)
    }

    /// Idempotent migrations: safe to run on every startup, any service
    /// order. Individual statement failures are logged, not fatal, so a
    /// replica racing another's migration does not crash.
    async fn reconcile_schema(&self) -> Result<()> {
        let migrations: &[(&str, &str)] = &[
            (
                "001_initial_schema",
                r#"CREATE TABLE IF NOT EXISTS artifacts (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    source_platform VARCHAR(50) DEFAULT 'tiktok',
                    source_url TEXT NOT NULL,
                    author_id VARCHAR(100),
                    invite_code VARCHAR(50),
                    server_name VARCHAR(255) DEFAULT '',
                    server_id VARCHAR(100) DEFAULT '',
                    member_count INT DEFAULT 0,
                    raw_text TEXT,
                    risk_score INT DEFAULT 0,
                    processed_at TIMESTAMPTZ DEFAULT NOW(),
                    UNIQUE(source_url, invite_code)
                )"#,
            ),
            (
                "002_add_server_icon_url",
                "ALTER TABLE artifacts ADD COLUMN IF NOT EXISTS server_icon_url TEXT DEFAULT ''",
            ),
            (
                "003_add_status",
                "ALTER TABLE artifacts ADD COLUMN IF NOT EXISTS status VARCHAR(20) DEFAULT 'pending'",
            ),
            (
                "004_indexes",
                "CREATE INDEX IF NOT EXISTS idx_artifacts_invite_code ON artifacts(invite_code)",
            ),
            (
                "005_indexes_server",
                "CREATE INDEX IF NOT EXISTS idx_artifacts_server_id ON artifacts(server_id)",
            ),
            (
                "006_indexes_risk",
                "CREATE INDEX IF NOT EXISTS idx_artifacts_risk_score ON artifacts(risk_score)",
            ),
        ];

        for (name, statement) in migrations {
            if let Err(e) = sqlx::query(statement).execute(&self.pool).await {
                warn!(migration = name, error = %e, "migration statement failed");
            }
        }
        info!("artifact schema reconciled");
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for PostgresArtifactStore {
    async fn upsert_shallow(&self, artifact: NewArtifact) -> Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO artifacts
                (source_url, author_id, invite_code, raw_text, risk_score, status, processed_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', NOW())
            ON CONFLICT (source_url, invite_code) DO UPDATE
            SET raw_text = CASE
                    WHEN artifacts.raw_text IS NULL OR artifacts.raw_text = ''
                        THEN EXCLUDED.raw_text
                    WHEN EXCLUDED.raw_text = ''
                        THEN artifacts.raw_text
                    ELSE artifacts.raw_text || $6 || EXCLUDED.raw_text
                END,
                processed_at = NOW()
            RETURNING id
            "#,
        )
        .bind(&artifact.source_url)
        .bind(&artifact.author_id)
        .bind(&artifact.invite_code)
        .bind(&artifact.raw_text)
        .bind(artifact.risk_score)
        .bind(RAW_TEXT_DELIMITER)
        .fetch_one(&self.pool)
        .await
        .context("upserting artifact")?;

        Ok(id)
    }

    async fn update_enriched(&self, invite_code: &str, enrichment: &Enrichment) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE artifacts
            SET server_name = $2,
                server_id = $3,
                server_icon_url = $4,
                member_count = $5,
                status = $6,
                processed_at = NOW()
            WHERE invite_code = $1
            "#,
        )
        .bind(invite_code)
        .bind(&enrichment.server_name)
        .bind(&enrichment.server_id)
        .bind(&enrichment.server_icon_url)
        .bind(enrichment.member_count)
        .bind(&enrichment.status)
        .execute(&self.pool)
        .await
        .context("updating enriched artifact")?;

        Ok(result.rows_affected())
    }

    async fn mark_expired(&self, invite_code: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE artifacts SET status = 'expired', processed_at = NOW() WHERE invite_code = $1",
        )
        .bind(invite_code)
        .execute(&self.pool)
        .await
        .context("marking artifact expired")?;

        Ok(result.rows_affected())
    }
}

/// Row snapshot used by the in-memory store.
#[derive(Debug, Clone)]
pub struct ArtifactRow {
    pub id: Uuid,
    pub source_url: String,
    pub author_id: String,
    pub invite_code: String,
    pub server_name: String,
    pub server_id: String,
    pub server_icon_url: String,
    pub member_count: i64,
    pub raw_text: String,
    pub risk_score: i32,
    pub status: String,
    pub processed_at: DateTime<Utc>,
}

/// In-memory store with the same conflict and update semantics, for tests.
#[derive(Default)]
pub struct MemoryArtifactStore {
    rows: Mutex<HashMap<(String, String), ArtifactRow>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<ArtifactRow> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn rows_for_code(&self, invite_code: &str) -> Vec<ArtifactRow> {
        self.rows()
            .into_iter()
            .filter(|r| r.invite_code == invite_code)
            .collect()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn upsert_shallow(&self, artifact: NewArtifact) -> Result<Uuid> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let key = (artifact.source_url.clone(), artifact.invite_code.clone());

        if let Some(row) = rows.get_mut(&key) {
            if row.raw_text.is_empty() {
                row.raw_text = artifact.raw_text;
            } else if !artifact.raw_text.is_empty() {
                row.raw_text = format!("{}{}{}", row.raw_text, RAW_TEXT_DELIMITER, artifact.raw_text);
            }
            row.processed_at = Utc::now();
            return Ok(row.id);
        }

        let row = ArtifactRow {
            id: Uuid::new_v4(),
            source_url: artifact.source_url,
            author_id: artifact.author_id,
            invite_code: artifact.invite_code,
            server_name: String::new(),
            server_id: String::new(),
            server_icon_url: String::new(),
            member_count: 0,
            raw_text: artifact.raw_text,
            risk_score: artifact.risk_score,
            status: "pending".to_string(),
            processed_at: Utc::now(),
        };
        let id = row.id;
        rows.insert(key, row);
        Ok(id)
    }

    async fn update_enriched(&self, invite_code: &str, enrichment: &Enrichment) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut touched = 0;
        for row in rows.values_mut().filter(|r| r.invite_code == invite_code) {
            row.server_name = enrichment.server_name.clone();
            row.server_id = enrichment.server_id.clone();
            row.server_icon_url = enrichment.server_icon_url.clone();
            row.member_count = enrichment.member_count;
            row.status = enrichment.status.clone();
            row.processed_at = Utc::now();
            touched += 1;
        }
        Ok(touched)
    }

    async fn mark_expired(&self, invite_code: &str) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut touched = 0;
        for row in rows.values_mut().filter(|r| r.invite_code == invite_code) {
            row.status = "expired".to_string();
            row.processed_at = Utc::now();
            touched += 1;
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shallow(url: &str, code: &str, text: &str) -> NewArtifact {
        NewArtifact {
            source_url: url.to_string(),
            author_id: "someone".to_string(),
            invite_code: code.to_string(),
            raw_text: text.to_string(),
            risk_score: 0,
        }
    }

    #[tokio::test]
    async fn upsert_concatenates_on_conflict() {
        let store = MemoryArtifactStore::new();
        let first = store.upsert_shallow(shallow("u", "abc", "one")).await.unwrap();
        let second = store.upsert_shallow(shallow("u", "abc", "two")).await.unwrap();
        assert_eq!(first, second);

        let rows = store.rows_for_code("abc");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].raw_text, format!("one{RAW_TEXT_DELIMITER}two"));
        assert_eq!(rows[0].status, "pending");
    }

    #[tokio::test]
    async fn same_code_different_posts_makes_two_rows() {
        let store = MemoryArtifactStore::new();
        store.upsert_shallow(shallow("u1", "abc", "t1")).await.unwrap();
        store.upsert_shallow(shallow("u2", "abc", "t2")).await.unwrap();
        assert_eq!(store.rows_for_code("abc").len(), 2);
    }

    #[tokio::test]
    async fn enrichment_touches_every_row_with_the_code() {
        let store = MemoryArtifactStore::new();
        store.upsert_shallow(shallow("u1", "abc", "t1")).await.unwrap();
        store.upsert_shallow(shallow("u2", "abc", "t2")).await.unwrap();
        store.upsert_shallow(shallow("u3", "other", "t3")).await.unwrap();

        let touched = store
            .update_enriched(
                "abc",
                &Enrichment {
                    server_name: "Alpha".into(),
                    server_id: "G".into(),
                    server_icon_url: "https://cdn/i.png".into(),
                    member_count: 42,
                    status: "active".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(touched, 2);

        for row in store.rows_for_code("abc") {
            assert_eq!(row.server_name, "Alpha");
            assert_eq!(row.member_count, 42);
            assert_eq!(row.status, "active");
            // raw text untouched by the narrow update
            assert!(row.raw_text.starts_with('t'));
        }
        assert_eq!(store.rows_for_code("other")[0].server_name, "");
    }

    #[tokio::test]
    async fn expiry_only_flips_status() {
        let store = MemoryArtifactStore::new();
        store.upsert_shallow(shallow("u", "gone", "text")).await.unwrap();
        let touched = store.mark_expired("gone").await.unwrap();
        assert_eq!(touched, 1);

        let row = &store.rows_for_code("gone")[0];
        assert_eq!(row.status, "expired");
        assert_eq!(row.server_name, "");
        assert_eq!(row.raw_text, "text");
    }

    #[tokio::test]
    async fn member_count_zero_is_stored_as_is() {
        let store = MemoryArtifactStore::new();
        store.upsert_shallow(shallow("u", "abc", "t")).await.unwrap();
        store
            .update_enriched(
                "abc",
                &Enrichment {
                    server_name: "Empty".into(),
                    server_id: "G".into(),
                    server_icon_url: String::new(),
                    member_count: 0,
                    status: "active".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(store.rows_for_code("abc")[0].member_count, 0);
    }
}
