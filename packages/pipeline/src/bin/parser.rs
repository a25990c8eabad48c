//! Parser service: runs the fast-ingestion and enricher flows.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use argus_core::domains::enrichment::{self, EnrichHandler, Enricher, SharedInviteCache};
use argus_core::domains::ingestion::{self, FastIngestion, IngestionHandler};
use argus_core::kernel::bus::{self, BusPublisher, JetStreamPublisher};
use argus_core::kernel::cache::{CacheStore, RedisStore};
use argus_core::kernel::dedup::Deduplicator;
use argus_core::kernel::envelope::Envelope;
use argus_core::kernel::metrics::MetricsServer;
use argus_core::kernel::service_host::ServiceHost;
use argus_core::repository::{ArtifactStore, PostgresArtifactStore};
use argus_core::search::{MeiliIndexer, SearchIndex};
use argus_core::Config;

const DEFAULT_METRICS_PORT: u16 = 8083;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,argus_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    dotenvy::dotenv().ok();
    let config = Config::load()?;

    tracing::info!("parser service starting");

    let repo: Arc<dyn ArtifactStore> = Arc::new(
        PostgresArtifactStore::connect(&config.database.url)
            .await
            .context("database is required at startup")?,
    );

    let search: Arc<dyn SearchIndex> = Arc::new(MeiliIndexer::new(&config.meilisearch));
    search.ensure().await.context("search index is required at startup")?;

    let store: Arc<dyn CacheStore> = Arc::new(
        RedisStore::connect(&config.redis)
            .await
            .context("cache is required at startup")?,
    );
    let dedup = Arc::new(Deduplicator::new(Arc::clone(&store)));

    let (_nats, js) = bus::connect(&config.nats.url).await?;
    bus::ensure_pipeline_streams(&js).await?;
    let publisher: Arc<dyn BusPublisher> = Arc::new(JetStreamPublisher::new(js.clone()));

    let invite_cache = Arc::new(SharedInviteCache::new(Arc::clone(&store)));
    let provider = directory_client::new_provider(
        config.discord.fetch_mode,
        config.discord.proxy.as_deref(),
        invite_cache,
    )
    .await
    .context("directory client is required at startup")?;

    let fast_ingestion = Arc::new(FastIngestion::new(
        js.clone(),
        Envelope::new(ingestion::STAGE, Arc::clone(&dedup), Arc::clone(&publisher)),
        IngestionHandler::new(Arc::clone(&publisher), Arc::clone(&repo), Arc::clone(&search)),
    ));

    let enricher = Arc::new(Enricher::new(
        js,
        Envelope::new(enrichment::STAGE, Arc::clone(&dedup), Arc::clone(&publisher)),
        EnrichHandler::new(Arc::clone(&dedup), repo, search, provider),
    ));

    let mut metric_defs = ingestion::metric_defs();
    metric_defs.extend(enrichment::metric_defs());
    let metrics = Arc::new(MetricsServer::new(
        config.metrics.port.unwrap_or(DEFAULT_METRICS_PORT),
        store,
        metric_defs,
    ));

    let outcome = ServiceHost::new()
        .with_service(fast_ingestion)
        .with_service(enricher)
        .with_service(metrics)
        .run_until_shutdown()
        .await;

    tracing::info!("parser service stopped");
    outcome
}
