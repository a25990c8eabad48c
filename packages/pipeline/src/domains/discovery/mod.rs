//! Discovery: tag queries -> `jobs.scrape`.
//!
//! Every cycle, each configured tag is rendered by a listing source and
//! the candidates are filtered against the processed markers before a
//! scrape job is published. Discovery never sets the markers itself - the
//! scrape worker does, after its artifact is durably published - so two
//! replicas racing the same post at worst publish a duplicate job that
//! the worker's envelope absorbs.

pub mod source;
pub mod tiktok;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DiscoveryConfig;
use crate::dto::ScrapeJob;
use crate::kernel::bus::{subjects, BusPublisher};
use crate::kernel::dedup::{Deduplicator, POST_STAGE_PREFIX};
use crate::kernel::metrics::MetricDef;
use crate::kernel::service_host::Service;

use self::source::ListingSource;

pub const STAGE: &str = "discovery";

/// Hard kill for a listing fetch wedged in browser automation; the tag
/// is treated as empty for this cycle.
const TAG_WATCHDOG: Duration = Duration::from_secs(5 * 60);

pub struct DiscoveryService {
    sources: Vec<Arc<dyn ListingSource>>,
    bus: Arc<dyn BusPublisher>,
    dedup: Arc<Deduplicator>,
    config: DiscoveryConfig,
}

impl DiscoveryService {
    pub fn new(
        sources: Vec<Arc<dyn ListingSource>>,
        bus: Arc<dyn BusPublisher>,
        dedup: Arc<Deduplicator>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            sources,
            bus,
            dedup,
            config,
        }
    }

    /// One full pass over all sources and tags.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) {
        info!(tags = self.config.hashtags.len(), "discovery cycle starting");

        for source in &self.sources {
            let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
            let mut tasks = JoinSet::new();

            for tag in &self.config.hashtags {
                if shutdown.is_cancelled() {
                    break;
                }
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };

                let source = Arc::clone(source);
                let bus = Arc::clone(&self.bus);
                let dedup = Arc::clone(&self.dedup);
                let tag = tag.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    process_tag(source, bus, dedup, tag).await;
                });
            }

            while tasks.join_next().await.is_some() {}
        }

        info!("discovery cycle finished");
    }
}

async fn process_tag(
    source: Arc<dyn ListingSource>,
    bus: Arc<dyn BusPublisher>,
    dedup: Arc<Deduplicator>,
    tag: String,
) {
    let posts = match tokio::time::timeout(TAG_WATCHDOG, source.fetch(&tag)).await {
        Ok(Ok(posts)) => posts,
        Ok(Err(e)) => {
            warn!(tag, source = source.name(), error = %e, "tag fetch failed; abandoning for this cycle");
            return;
        }
        Err(_) => {
            warn!(tag, source = source.name(), "tag watchdog fired; treating listing as empty");
            return;
        }
    };

    for post in posts {
        match dedup.processed(POST_STAGE_PREFIX, &post.id).await {
            Ok(true) => {
                dedup.incr(STAGE, "duplicates").await;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(tag, post_id = %post.id, error = %e, "dedup check failed");
                dedup.incr(STAGE, "failed").await;
                continue;
            }
        }

        let job = ScrapeJob {
            video_id: post.id.clone(),
            video_url: post.url.clone(),
            hashtag: tag.clone(),
        };
        let payload = match serde_json::to_vec(&job) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(post_id = %post.id, error = %e, "could not serialize scrape job");
                dedup.incr(STAGE, "failed").await;
                continue;
            }
        };

        match bus.publish(subjects::SCRAPE.to_string(), payload.into()).await {
            Ok(()) => {
                info!(tag, post_id = %post.id, "scrape job enqueued");
                dedup.incr(STAGE, "enqueued").await;
            }
            Err(e) => {
                warn!(tag, post_id = %post.id, error = %e, "scrape job publish failed");
                dedup.incr(STAGE, "failed").await;
            }
        }
    }
}

#[async_trait]
impl Service for DiscoveryService {
    fn name(&self) -> &'static str {
        "discovery"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let interval = Duration::from_secs(self.config.interval_seconds.max(1));
        info!(?interval, workers = self.config.workers, "discovery service running");

        loop {
            self.run_cycle(&shutdown).await;
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

pub fn metric_defs() -> Vec<MetricDef> {
    vec![
        MetricDef::counter(STAGE, "enqueued", "Scrape jobs published"),
        MetricDef::counter(STAGE, "duplicates", "Candidates already processed"),
        MetricDef::counter(STAGE, "failed", "Candidates that failed to enqueue"),
    ]
}
