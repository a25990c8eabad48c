//! The pipeline envelope: the uniform wrapper around every consumer
//! handler.
//!
//! For each delivery the envelope reads broker metadata, decodes the
//! payload, enforces idempotency, routes poison messages to the stage DLQ,
//! takes the per-entity processing lock, runs the stage handler, and
//! acknowledges. Ordering on success is significant: downstream effects
//! happen inside the handler, then the processed marker is set, then the
//! message is acked - a crash in between shows up as a duplicate that the
//! next stage's idempotency check absorbs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::bus::{subjects, BusPublisher};
use super::dedup::{Deduplicator, LOCK_TTL, PROCESSED_TTL};
use crate::dto::{DlqMetadata, DlqRecord};

/// Fixed nak delay for rate-limit-class failures.
pub const RATE_LIMIT_NAK: Duration = Duration::from_secs(60);
/// Exponential backoff ceiling.
pub const BACKOFF_CAP: Duration = Duration::from_secs(3600);

/// A received bus message, abstracted so the envelope can be driven by
/// test doubles as well as JetStream deliveries.
#[async_trait]
pub trait InboundMessage: Send + Sync {
    fn payload(&self) -> &[u8];

    /// Broker delivery count, or `None` when the metadata is unreadable
    /// (structurally corrupt message).
    fn delivered(&self) -> Option<i64>;

    async fn ack(&self) -> Result<()>;

    async fn nak(&self, delay: Duration) -> Result<()>;
}

/// JetStream-backed [`InboundMessage`].
pub struct JsMessage(pub jetstream::Message);

#[async_trait]
impl InboundMessage for JsMessage {
    fn payload(&self) -> &[u8] {
        &self.0.payload
    }

    fn delivered(&self) -> Option<i64> {
        self.0.info().ok().map(|info| info.delivered)
    }

    async fn ack(&self) -> Result<()> {
        self.0.ack().await.map_err(|e| anyhow::anyhow!("ack: {e}"))
    }

    async fn nak(&self, delay: Duration) -> Result<()> {
        self.0
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| anyhow::anyhow!("nak: {e}"))
    }
}

/// Per-stage envelope parameters.
#[derive(Debug, Clone)]
pub struct StagePolicy {
    /// Stage name: DLQ subject suffix, counter namespace, log field.
    pub stage: &'static str,
    /// Idempotency-marker prefix for this stage.
    pub prefix: &'static str,
    /// Retry budget: deliveries beyond this count go to the DLQ.
    pub max_deliveries: i64,
}

impl StagePolicy {
    pub const fn new(stage: &'static str, prefix: &'static str, max_deliveries: i64) -> Self {
        Self {
            stage,
            prefix,
            max_deliveries,
        }
    }
}

/// What a stage handler reports back to the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Effects are durably in place: set the processed marker, then ack.
    Complete,
    /// Terminal skip (e.g. artifact without conversation): ack without
    /// marking, no failure counted.
    Discard,
}

/// Failure classes a handler can surface.
#[derive(Debug, Error)]
pub enum StageError {
    /// External service shed load; nak a fixed minute. The handler is
    /// responsible for opening the relevant circuit before returning this.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Anything worth retrying with exponential backoff.
    #[error(transparent)]
    Retry(#[from] anyhow::Error),
}

/// How the envelope disposed of a delivery. Returned for observability
/// and test assertions; callers normally ignore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Discarded,
    /// Idempotency marker was already set.
    Duplicate,
    /// Metadata or payload was unreadable; acked and dropped.
    Malformed,
    DeadLettered,
    LockBusy { delay: Duration },
    Retried { delay: Duration },
    RateLimited { delay: Duration },
}

pub struct Envelope {
    policy: StagePolicy,
    dedup: Arc<Deduplicator>,
    bus: Arc<dyn BusPublisher>,
}

impl Envelope {
    pub fn new(policy: StagePolicy, dedup: Arc<Deduplicator>, bus: Arc<dyn BusPublisher>) -> Self {
        Self { policy, dedup, bus }
    }

    pub fn policy(&self) -> &StagePolicy {
        &self.policy
    }

    /// Runs one delivery through the stage lifecycle.
    ///
    /// `key_of` derives the idempotency/lock key from the decoded payload:
    /// the stable entity id where one exists, a deterministic fingerprint
    /// otherwise.
    pub async fn process<P, K, H, Fut>(
        &self,
        msg: &dyn InboundMessage,
        key_of: K,
        handler: H,
    ) -> Disposition
    where
        P: DeserializeOwned + Serialize + Send,
        K: FnOnce(&P) -> String,
        H: FnOnce(P) -> Fut,
        Fut: Future<Output = std::result::Result<HandlerOutcome, StageError>>,
    {
        let stage = self.policy.stage;

        // 1. Broker metadata. Unreadable means the message is structurally
        // corrupt; retrying cannot fix it.
        let Some(delivered) = msg.delivered() else {
            warn!(stage, "delivery metadata unreadable; dropping");
            self.ack_quietly(msg).await;
            return Disposition::Malformed;
        };

        // 2. Decode. A malformed payload never becomes well-formed.
        let payload: P = match serde_json::from_slice(msg.payload()) {
            Ok(p) => p,
            Err(e) => {
                warn!(stage, error = %e, "payload decode failed; dropping");
                self.ack_quietly(msg).await;
                return Disposition::Malformed;
            }
        };

        let key = key_of(&payload);

        // 3. Idempotency.
        match self.dedup.processed(self.policy.prefix, &key).await {
            Ok(true) => {
                debug!(stage, key, "duplicate delivery ignored");
                self.ack_quietly(msg).await;
                return Disposition::Duplicate;
            }
            Ok(false) => {}
            Err(e) => {
                // Cache trouble: retry rather than risk double-processing
                // without the marker in place.
                warn!(stage, key, error = %e, "idempotency check failed");
                let delay = with_jitter(retry_backoff(delivered));
                self.nak_quietly(msg, delay).await;
                return Disposition::Retried { delay };
            }
        }

        // 4. Retry budget. The only exit from the retry loop other than
        // success.
        if delivered > self.policy.max_deliveries {
            return self.dead_letter(msg, &payload, &key, delivered).await;
        }

        // 5. Exclusive processing lock.
        match self.dedup.try_lock(&key, LOCK_TTL).await {
            Ok(true) => {}
            Ok(false) => {
                let delay = lock_busy_delay();
                info!(stage, key, ?delay, "entity locked elsewhere; nak");
                self.nak_quietly(msg, delay).await;
                return Disposition::LockBusy { delay };
            }
            Err(e) => {
                warn!(stage, key, error = %e, "lock acquisition failed");
                let delay = with_jitter(retry_backoff(delivered));
                self.nak_quietly(msg, delay).await;
                return Disposition::Retried { delay };
            }
        }

        // 6-7. Handler, then settle. The lock is released on every path.
        let result = handler(payload).await;
        self.dedup.release(&key).await;

        match result {
            Ok(HandlerOutcome::Complete) => {
                if let Err(e) = self.dedup.mark(self.policy.prefix, &key, PROCESSED_TTL).await {
                    // The effect is durable; a missing marker only costs a
                    // duplicate pass later.
                    warn!(stage, key, error = %e, "failed to set processed marker");
                }
                self.dedup.incr(stage, "processed").await;
                self.ack_quietly(msg).await;
                info!(stage, key, attempt = delivered, "completed");
                Disposition::Completed
            }
            Ok(HandlerOutcome::Discard) => {
                self.ack_quietly(msg).await;
                info!(stage, key, "discarded");
                Disposition::Discarded
            }
            Err(StageError::RateLimited(reason)) => {
                warn!(stage, key, reason, "rate limited; nak 1 min");
                self.nak_quietly(msg, RATE_LIMIT_NAK).await;
                Disposition::RateLimited {
                    delay: RATE_LIMIT_NAK,
                }
            }
            Err(StageError::Retry(e)) => {
                let delay = with_jitter(retry_backoff(delivered));
                warn!(stage, key, attempt = delivered, error = %e, ?delay, "handler failed; nak");
                self.dedup.incr(stage, "failed").await;
                self.nak_quietly(msg, delay).await;
                Disposition::Retried { delay }
            }
        }
    }

    async fn dead_letter<P: Serialize>(
        &self,
        msg: &dyn InboundMessage,
        payload: &P,
        key: &str,
        delivered: i64,
    ) -> Disposition {
        let stage = self.policy.stage;
        let record = DlqRecord {
            error: "Max retries exceeded".to_string(),
            job: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            metadata: DlqMetadata {
                num_delivered: delivered,
                timestamp: Utc::now(),
            },
        };

        let data = match serde_json::to_vec(&record) {
            Ok(d) => d,
            Err(e) => {
                warn!(stage, key, error = %e, "could not serialize DLQ record");
                self.ack_quietly(msg).await;
                return Disposition::DeadLettered;
            }
        };

        match self.bus.publish(subjects::dlq(stage), data.into()).await {
            Ok(()) => {
                warn!(stage, key, delivered, "retry budget exhausted; dead-lettered");
                self.dedup.incr(stage, "dlq").await;
                self.ack_quietly(msg).await;
                Disposition::DeadLettered
            }
            Err(e) => {
                // Keep the message in the stream until the DLQ publish works;
                // losing it silently would violate at-least-once.
                warn!(stage, key, error = %e, "DLQ publish failed; nak 1 min");
                self.nak_quietly(msg, RATE_LIMIT_NAK).await;
                Disposition::Retried {
                    delay: RATE_LIMIT_NAK,
                }
            }
        }
    }

    async fn ack_quietly(&self, msg: &dyn InboundMessage) {
        if let Err(e) = msg.ack().await {
            warn!(stage = self.policy.stage, error = %e, "ack failed");
        }
    }

    async fn nak_quietly(&self, msg: &dyn InboundMessage, delay: Duration) {
        if let Err(e) = msg.nak(delay).await {
            warn!(stage = self.policy.stage, error = %e, "nak failed");
        }
    }
}

/// Exponential backoff for the nth delivery: `5 * 5^(n-1)` seconds,
/// capped.
pub fn retry_backoff(num_delivered: i64) -> Duration {
    let attempt = num_delivered.clamp(1, 16) as u32;
    let secs = 5u64.saturating_mul(5u64.saturating_pow(attempt - 1));
    Duration::from_secs(secs).min(BACKOFF_CAP)
}

/// Adds uniform jitter of up to 20% on top of a base delay.
pub fn with_jitter(base: Duration) -> Duration {
    let extra_ms = base.as_millis() as u64 / 5;
    if extra_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=extra_ms))
}

/// Jittered delay for lock contention: 30-60 s.
pub fn lock_busy_delay() -> Duration {
    Duration::from_secs(30 + rand::thread_rng().gen_range(0..30))
}
