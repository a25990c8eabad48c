//! Scrape worker: consumes `jobs.scrape`, drives the browser, publishes
//! `data.text_extracted`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use argus_core::browser::captcha::{CaptchaResolver, PassiveResolver};
use argus_core::browser::sweeper::ProfileSweeper;
use argus_core::browser::{BrowserSession, SessionConfig};
use argus_core::domains::scrape::{self, ScrapeWorker, STAGE};
use argus_core::kernel::bus::{self, BusPublisher, JetStreamPublisher};
use argus_core::kernel::cache::{CacheStore, RedisStore};
use argus_core::kernel::dedup::Deduplicator;
use argus_core::kernel::envelope::Envelope;
use argus_core::kernel::metrics::MetricsServer;
use argus_core::kernel::service_host::ServiceHost;
use argus_core::Config;

const DEFAULT_METRICS_PORT: u16 = 8082;

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

    let worker_id = std::env::var("WORKER_ID").unwrap_or_else(|_| "1".to_string());
    tracing::info!(
        worker_id,
        pool = config.scraper.workers,
        "scrape worker starting (one browser per process; scale out with more processes)"
    );

    let store: Arc<dyn CacheStore> = Arc::new(
        RedisStore::connect(&config.redis)
            .await
            .context("cache is required at startup")?,
    );
    let dedup = Arc::new(Deduplicator::new(Arc::clone(&store)));

    let (_nats, js) = bus::connect(&config.nats.url).await?;
    bus::ensure_pipeline_streams(&js).await?;
    let publisher: Arc<dyn BusPublisher> = Arc::new(JetStreamPublisher::new(js.clone()));

    let state_dir = format!(
        "{}_worker_{}",
        config.scraper.browser_state_dir.trim_end_matches('/'),
        worker_id
    );
    let session = Arc::new(
        BrowserSession::launch(&SessionConfig {
            state_dir: state_dir.clone().into(),
            headless: config.browser.headless,
        })
        .await
        .context("browser is required at startup")?,
    );
    tracing::info!(state_dir, "browser profile ready");

    let captcha: Arc<dyn CaptchaResolver> = Arc::new(PassiveResolver);
    let envelope = Envelope::new(STAGE, Arc::clone(&dedup), Arc::clone(&publisher));

    let worker = Arc::new(ScrapeWorker::new(
        js,
        envelope,
        Arc::clone(&publisher),
        Arc::clone(&session),
        captcha,
        worker_id,
    ));

    let metrics = Arc::new(MetricsServer::new(
        config.metrics.port.unwrap_or(DEFAULT_METRICS_PORT),
        store,
        scrape::metric_defs(),
    ));

    let outcome = ServiceHost::new()
        .with_service(worker)
        .with_service(Arc::new(ProfileSweeper))
        .with_service(metrics)
        .run_until_shutdown()
        .await;

    if let Err(e) = session.close().await {
        tracing::warn!(error = %e, "browser close failed during shutdown");
    }

    tracing::info!("scrape worker stopped");
    outcome
}
