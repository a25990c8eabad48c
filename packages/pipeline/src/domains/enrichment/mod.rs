//! Enricher: invite codes -> completed records.
//!
//! Consumes `jobs.enrich.discord`, resolves each code against the
//! external directory, and completes both the relational row and the
//! search document. A 429 opens the shared circuit breaker; an invalid or
//! expired invite is a terminal negative result, not a failure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_nats::jetstream;
use async_nats::jetstream::consumer::{pull, PullConsumer};
use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use directory_client::{DirectoryError, DirectoryProvider, InviteCache};

use crate::dto::InviteEnrichJob;
use crate::kernel::bus::{consumers, subjects};
use crate::kernel::cache::CacheStore;
use crate::kernel::dedup::{Deduplicator, CIRCUIT_TTL};
use crate::kernel::envelope::{Envelope, HandlerOutcome, JsMessage, StageError, StagePolicy};
use crate::kernel::metrics::MetricDef;
use crate::kernel::service_host::Service;
use crate::repository::{ArtifactStore, Enrichment};
use crate::search::{SearchDocPatch, SearchIndex};

pub const STAGE: StagePolicy = StagePolicy::new("enricher", "enricher", 5);

/// Circuit-breaker name for the external directory.
pub const DIRECTORY_SERVICE: &str = "discord";

/// Positive directory cache backed by the shared cache
/// (`directory:invite:<code>`, 24 h TTL).
pub struct SharedInviteCache {
    cache: Arc<dyn CacheStore>,
}

impl SharedInviteCache {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    fn key(code: &str) -> String {
        format!("directory:invite:{code}")
    }
}

#[async_trait]
impl InviteCache for SharedInviteCache {
    async fn fetch(&self, code: &str) -> Option<String> {
        self.cache.get(&Self::key(code)).await.ok().flatten()
    }

    async fn store(&self, code: &str, payload: String, ttl: Duration) {
        if let Err(e) = self.cache.set_ttl(&Self::key(code), &payload, ttl).await {
            warn!(code, error = %e, "could not cache directory response");
        }
    }
}

/// The stage logic, separated from the consumer loop so it can run
/// against in-memory doubles and a scripted provider.
pub struct EnrichHandler {
    dedup: Arc<Deduplicator>,
    repo: Arc<dyn ArtifactStore>,
    search: Arc<dyn SearchIndex>,
    provider: Arc<dyn DirectoryProvider>,
}

impl EnrichHandler {
    pub fn new(
        dedup: Arc<Deduplicator>,
        repo: Arc<dyn ArtifactStore>,
        search: Arc<dyn SearchIndex>,
        provider: Arc<dyn DirectoryProvider>,
    ) -> Self {
        Self {
            dedup,
            repo,
            search,
            provider,
        }
    }

    /// Stage handler for one invite code.
    pub async fn handle(&self, job: InviteEnrichJob) -> Result<HandlerOutcome, StageError> {
        let code = job.invite_code.as_str();

        // Another message may have enriched this code already; skip the
        // external call and save quota.
        match self.search.get(code).await {
            Ok(Some(doc)) if !doc.server_name.is_empty() && !doc.icon_url.is_empty() => {
                info!(code, server = %doc.server_name, "already enriched; skipping");
                return Ok(HandlerOutcome::Complete);
            }
            Ok(_) => {}
            Err(e) => warn!(code, error = %e, "enriched-check read failed; continuing"),
        }

        // Circuit open means someone recently got shed; do not pile on.
        if self
            .dedup
            .circuit_open(DIRECTORY_SERVICE)
            .await
            .unwrap_or(false)
        {
            return Err(StageError::RateLimited("directory circuit open".into()));
        }

        match self.provider.get(code).await {
            Ok(info) => {
                let icon_url = info.icon_url();
                info!(
                    code,
                    server = %info.guild.name,
                    members = info.approximate_member_count,
                    "invite resolved"
                );

                self.search
                    .upsert(
                        SearchDocPatch::new(code)
                            .server_name(&info.guild.name)
                            .icon_url(&icon_url)
                            .member_count(info.approximate_member_count)
                            .status("active"),
                    )
                    .await
                    .map_err(StageError::Retry)?;

                self.repo
                    .update_enriched(
                        code,
                        &Enrichment {
                            server_name: info.guild.name.clone(),
                            server_id: info.guild.id.clone(),
                            server_icon_url: icon_url,
                            member_count: info.approximate_member_count,
                            status: "active".to_string(),
                        },
                    )
                    .await
                    .map_err(StageError::Retry)?;

                self.dedup.incr(STAGE.stage, "enriched").await;
                Ok(HandlerOutcome::Complete)
            }
            Err(DirectoryError::RateLimited) => {
                warn!(code, "directory rate limited; opening circuit");
                if let Err(e) = self
                    .dedup
                    .open_circuit(DIRECTORY_SERVICE, CIRCUIT_TTL)
                    .await
                {
                    warn!(error = %e, "could not open directory circuit");
                }
                Err(StageError::RateLimited("directory returned 429".into()))
            }
            Err(DirectoryError::NotFound) => {
                // Terminal negative: record it and move on.
                info!(code, "invite expired; marking record");
                self.search
                    .upsert(SearchDocPatch::new(code).status("expired"))
                    .await
                    .map_err(StageError::Retry)?;
                self.repo
                    .mark_expired(code)
                    .await
                    .map_err(StageError::Retry)?;
                self.dedup.incr(STAGE.stage, "expired").await;
                Ok(HandlerOutcome::Complete)
            }
            Err(e) => Err(StageError::Retry(anyhow::anyhow!(e))),
        }
    }
}

/// Durable consumer wrapping [`EnrichHandler`] in the stage envelope.
pub struct Enricher {
    js: jetstream::Context,
    envelope: Envelope,
    handler: EnrichHandler,
}

impl Enricher {
    pub fn new(js: jetstream::Context, envelope: Envelope, handler: EnrichHandler) -> Self {
        Self {
            js,
            envelope,
            handler,
        }
    }
}

#[async_trait]
impl Service for Enricher {
    fn name(&self) -> &'static str {
        "enricher"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let stream = self
            .js
            .get_stream("ENRICH")
            .await
            .map_err(|e| anyhow::anyhow!("getting ENRICH stream: {e}"))?;
        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                consumers::ENRICHER,
                pull::Config {
                    durable_name: Some(consumers::ENRICHER.to_string()),
                    filter_subject: subjects::ENRICH_DISCORD.to_string(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("creating enricher consumer: {e}"))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| anyhow::anyhow!("subscribing to {}: {e}", subjects::ENRICH_DISCORD))?;

        info!("enricher consuming {}", subjects::ENRICH_DISCORD);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                next = messages.next() => {
                    let Some(delivery) = next else { return Ok(()) };
                    match delivery {
                        Ok(message) => {
                            self.envelope
                                .process::<InviteEnrichJob, _, _, _>(
                                    &JsMessage(message),
                                    |job| job.invite_code.clone(),
                                    |job| self.handler.handle(job),
                                )
                                .await;
                        }
                        Err(e) => {
                            warn!(error = %e, "enricher delivery error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }
}

pub fn metric_defs() -> Vec<MetricDef> {
    vec![
        MetricDef::counter("enricher", "processed", "Enrich jobs completed"),
        MetricDef::counter("enricher", "enriched", "Invites resolved as active"),
        MetricDef::counter("enricher", "expired", "Invites resolved as expired"),
        MetricDef::counter("enricher", "failed", "Enrichment handler failures"),
        MetricDef::counter("enricher", "dlq", "Enrich jobs dead-lettered"),
    ]
}
