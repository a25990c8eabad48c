//! Discovery service: renders tag listings and feeds `jobs.scrape`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use argus_core::browser::captcha::{CaptchaResolver, PassiveResolver};
use argus_core::browser::{BrowserSession, SessionConfig};
use argus_core::domains::discovery::source::ListingSource;
use argus_core::domains::discovery::tiktok::TikTokSource;
use argus_core::domains::discovery::{self, DiscoveryService};
use argus_core::kernel::bus::{self, BusPublisher, JetStreamPublisher};
use argus_core::kernel::cache::{CacheStore, RedisStore};
use argus_core::kernel::dedup::Deduplicator;
use argus_core::kernel::metrics::MetricsServer;
use argus_core::kernel::service_host::ServiceHost;
use argus_core::Config;

const DEFAULT_METRICS_PORT: u16 = 8081;
const BROWSER_STATE_DIR: &str = "./browser_state_discovery";

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

    tracing::info!(
        tags = config.discovery.hashtags.len(),
        interval = config.discovery.interval_seconds,
        "discovery service starting"
    );

    let store: Arc<dyn CacheStore> = Arc::new(
        RedisStore::connect(&config.redis)
            .await
            .context("cache is required at startup")?,
    );
    let dedup = Arc::new(Deduplicator::new(Arc::clone(&store)));

    let (_nats, js) = bus::connect(&config.nats.url).await?;
    bus::ensure_pipeline_streams(&js).await?;
    let publisher: Arc<dyn BusPublisher> = Arc::new(JetStreamPublisher::new(js));

    let session = Arc::new(
        BrowserSession::launch(&SessionConfig {
            state_dir: BROWSER_STATE_DIR.into(),
            headless: config.browser.headless,
        })
        .await
        .context("browser is required at startup")?,
    );

    let captcha: Arc<dyn CaptchaResolver> = Arc::new(PassiveResolver);
    let source: Arc<dyn ListingSource> = Arc::new(TikTokSource::new(
        Arc::clone(&session),
        captcha,
        config.discovery.max_posts,
    ));

    let service = Arc::new(DiscoveryService::new(
        vec![source],
        publisher,
        Arc::clone(&dedup),
        config.discovery.clone(),
    ));

    let metrics = Arc::new(MetricsServer::new(
        config.metrics.port.unwrap_or(DEFAULT_METRICS_PORT),
        store,
        discovery::metric_defs(),
    ));

    let outcome = ServiceHost::new()
        .with_service(service)
        .with_service(metrics)
        .run_until_shutdown()
        .await;

    if let Err(e) = session.close().await {
        tracing::warn!(error = %e, "browser close failed during shutdown");
    }

    tracing::info!("discovery service stopped");
    outcome
}
