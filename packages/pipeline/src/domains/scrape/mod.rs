//! Scrape worker: `jobs.scrape` -> `data.text_extracted`.
//!
//! One worker process owns one browser; the pull consumer fetches a
//! single job at a time and the broker load-balances across worker
//! processes in the shared group. Horizontal scale = more processes.

pub mod comments;
pub mod post;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_nats::jetstream;
use async_nats::jetstream::consumer::{pull, PullConsumer};
use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::browser::captcha::CaptchaResolver;
use crate::browser::BrowserSession;
use crate::dto::ScrapeJob;
use crate::kernel::bus::{consumers, subjects, BusPublisher};
use crate::kernel::dedup::POST_STAGE_PREFIX;
use crate::kernel::envelope::{
    Disposition, Envelope, HandlerOutcome, JsMessage, StageError, StagePolicy,
};
use crate::kernel::metrics::MetricDef;
use crate::kernel::service_host::Service;

/// Scraping gets a deep retry budget: most failures are the site acting
/// up, not the job being poison.
pub const STAGE: StagePolicy = StagePolicy::new("scraper", POST_STAGE_PREFIX, 15);

/// Redelivery must not race a long scrape.
const ACK_WAIT: Duration = Duration::from_secs(10 * 60);
const FETCH_WAIT: Duration = Duration::from_secs(5);

pub struct ScrapeWorker {
    js: jetstream::Context,
    envelope: Envelope,
    bus: Arc<dyn BusPublisher>,
    session: Arc<BrowserSession>,
    captcha: Arc<dyn CaptchaResolver>,
    worker_id: String,
}

impl ScrapeWorker {
    pub fn new(
        js: jetstream::Context,
        envelope: Envelope,
        bus: Arc<dyn BusPublisher>,
        session: Arc<BrowserSession>,
        captcha: Arc<dyn CaptchaResolver>,
        worker_id: String,
    ) -> Self {
        Self {
            js,
            envelope,
            bus,
            session,
            captcha,
            worker_id,
        }
    }

    /// Stage handler for one scrape job.
    pub async fn handle(&self, job: ScrapeJob) -> Result<HandlerOutcome, StageError> {
        info!(
            worker = %self.worker_id,
            video_id = %job.video_id,
            hashtag = %job.hashtag,
            "processing scrape job"
        );

        let payload = post::process_post(self.session.as_ref(), self.captcha.as_ref(), &job)
            .await
            .map_err(StageError::Retry)?;

        // Only posts with conversation feed the downstream pipeline.
        if payload.metadata.comments.is_empty() {
            info!(video_id = %job.video_id, "no comments captured; skipping");
            return Ok(HandlerOutcome::Discard);
        }

        let data = serde_json::to_vec(&payload)
            .map_err(|e| StageError::Retry(anyhow::anyhow!("serializing artifact: {e}")))?;
        self.bus
            .publish(subjects::TEXT_EXTRACTED.to_string(), data.into())
            .await
            .map_err(StageError::Retry)?;

        info!(video_id = %job.video_id, "artifact published");
        Ok(HandlerOutcome::Complete)
    }
}

#[async_trait]
impl Service for ScrapeWorker {
    fn name(&self) -> &'static str {
        "scrape-worker"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let stream = self
            .js
            .get_stream("SCRAPE")
            .await
            .map_err(|e| anyhow::anyhow!("getting SCRAPE stream: {e}"))?;
        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                consumers::SCRAPE_WORKERS,
                pull::Config {
                    durable_name: Some(consumers::SCRAPE_WORKERS.to_string()),
                    ack_wait: ACK_WAIT,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("creating scrape consumer: {e}"))?;

        info!(worker = %self.worker_id, "scrape worker consuming {}", subjects::SCRAPE);

        // One message per fetch: one browser, one tab, one job at a time.
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let batch = consumer
                .fetch()
                .max_messages(1)
                .expires(FETCH_WAIT)
                .messages()
                .await;

            let mut batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "fetch failed; backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(Duration::from_secs(2)) => continue,
                    }
                }
            };

            while let Some(delivery) = batch.next().await {
                let message = match delivery {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "scrape delivery error");
                        continue;
                    }
                };

                let disposition = self
                    .envelope
                    .process::<ScrapeJob, _, _, _>(
                        &JsMessage(message),
                        |job| job.video_id.clone(),
                        |job| self.handle(job),
                    )
                    .await;

                if disposition == Disposition::Completed {
                    // Anti-rate-limit pause between successful jobs.
                    let pause = Duration::from_secs(rand::thread_rng().gen_range(3..=8));
                    info!(?pause, "post-job pause");
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }
    }
}

pub fn metric_defs() -> Vec<MetricDef> {
    vec![
        MetricDef::counter("scraper", "processed", "Posts scraped and published"),
        MetricDef::counter("scraper", "failed", "Scrape handler failures"),
        MetricDef::counter("scraper", "dlq", "Scrape jobs dead-lettered"),
    ]
}
