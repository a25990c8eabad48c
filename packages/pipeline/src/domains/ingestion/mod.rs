//! Fast ingestion: text artifacts -> shallow records + enrich jobs.
//!
//! Consumes `data.text_extracted`. Artifacts have no stable entity id, so
//! idempotency is keyed by an MD5 fingerprint of the trimmed source URL -
//! trim only, no case folding, so the key is stable across retries
//! regardless of payload-map ordering.

pub mod finder;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_nats::jetstream;
use async_nats::jetstream::consumer::{pull, PullConsumer};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use md5::{Digest, Md5};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dto::{ArtifactPayload, InviteEnrichJob};
use crate::kernel::bus::{consumers, subjects, BusPublisher};
use crate::kernel::envelope::{Envelope, HandlerOutcome, JsMessage, StageError, StagePolicy};
use crate::kernel::metrics::MetricDef;
use crate::kernel::service_host::Service;
use crate::repository::{ArtifactStore, NewArtifact};
use crate::search::{SearchDocPatch, SearchIndex};
use self::finder::{code_from_link, InviteFinder};

pub const STAGE: StagePolicy = StagePolicy::new("fast_ingestion", "fast_ingestion", 5);

const UNKNOWN_AUTHOR: &str = "unknown";
const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// Stage idempotency key: MD5 over the trimmed source URL.
pub fn fingerprint(source_path: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(source_path.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// The stage logic, separated from the consumer loop so it can run
/// against in-memory doubles.
pub struct IngestionHandler {
    bus: Arc<dyn BusPublisher>,
    repo: Arc<dyn ArtifactStore>,
    search: Arc<dyn SearchIndex>,
    finder: InviteFinder,
}

impl IngestionHandler {
    pub fn new(
        bus: Arc<dyn BusPublisher>,
        repo: Arc<dyn ArtifactStore>,
        search: Arc<dyn SearchIndex>,
    ) -> Self {
        Self {
            bus,
            repo,
            search,
            finder: InviteFinder::new(),
        }
    }

    /// Stage handler: extract codes, persist shallow records, hand codes
    /// to the enricher.
    pub async fn handle(&self, payload: ArtifactPayload) -> Result<HandlerOutcome, StageError> {
        let links = self.finder.find_invites(&payload.text_content);
        if links.is_empty() {
            return Ok(HandlerOutcome::Complete);
        }

        let author = payload
            .author_id
            .clone()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());

        // The same code often appears in both description and comments of
        // one artifact; process it once per message.
        let mut seen = std::collections::HashSet::new();

        for link in links {
            let Some(code) = code_from_link(&link) else {
                continue;
            };
            if !seen.insert(code.clone()) {
                continue;
            }

            info!(code, source = %payload.source_path, "invite code found");

            self.repo
                .upsert_shallow(NewArtifact {
                    source_url: payload.source_path.clone(),
                    author_id: author.clone(),
                    invite_code: code.clone(),
                    raw_text: payload.text_content.clone(),
                    risk_score: 0,
                })
                .await
                .context("persisting shallow artifact")?;

            self.search
                .upsert(
                    SearchDocPatch::new(&code)
                        .source_url(&payload.source_path)
                        .status("pending")
                        .timestamp_formatted(Utc::now().format(TIMESTAMP_FORMAT).to_string()),
                )
                .await
                .context("indexing shallow artifact")?;

            // The row is durable; a failed enqueue only delays enrichment,
            // so it must not fail the whole artifact.
            let job = InviteEnrichJob {
                invite_code: code.clone(),
            };
            let data = serde_json::to_vec(&job).context("serializing enrich job")?;
            if let Err(e) = self
                .bus
                .publish(subjects::ENRICH_DISCORD.to_string(), data.into())
                .await
            {
                warn!(code, error = %e, "enrich enqueue failed; row persisted, will re-enrich later");
            }
        }

        Ok(HandlerOutcome::Complete)
    }
}

/// Durable consumer wrapping [`IngestionHandler`] in the stage envelope.
pub struct FastIngestion {
    js: jetstream::Context,
    envelope: Envelope,
    handler: IngestionHandler,
}

impl FastIngestion {
    pub fn new(js: jetstream::Context, envelope: Envelope, handler: IngestionHandler) -> Self {
        Self {
            js,
            envelope,
            handler,
        }
    }
}

#[async_trait]
impl Service for FastIngestion {
    fn name(&self) -> &'static str {
        "fast-ingestion"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let stream = self
            .js
            .get_stream("DATA")
            .await
            .map_err(|e| anyhow::anyhow!("getting DATA stream: {e}"))?;
        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                consumers::FAST_INGESTION,
                pull::Config {
                    durable_name: Some(consumers::FAST_INGESTION.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("creating fast-ingestion consumer: {e}"))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| anyhow::anyhow!("subscribing to {}: {e}", subjects::TEXT_EXTRACTED))?;

        info!("fast ingestion consuming {}", subjects::TEXT_EXTRACTED);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                next = messages.next() => {
                    let Some(delivery) = next else { return Ok(()) };
                    match delivery {
                        Ok(message) => {
                            self.envelope
                                .process::<ArtifactPayload, _, _, _>(
                                    &JsMessage(message),
                                    |payload| fingerprint(&payload.source_path),
                                    |payload| self.handler.handle(payload),
                                )
                                .await;
                        }
                        Err(e) => {
                            warn!(error = %e, "fast ingestion delivery error");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }
}

pub fn metric_defs() -> Vec<MetricDef> {
    vec![
        MetricDef::counter("fast_ingestion", "processed", "Artifacts ingested"),
        MetricDef::counter("fast_ingestion", "failed", "Ingestion handler failures"),
        MetricDef::counter("fast_ingestion", "dlq", "Artifacts dead-lettered"),
    ]
}
