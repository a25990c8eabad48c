//! Deduplication, locking, circuit breaking and counters over the cache.
//!
//! Key families (all namespaced under `argus:`):
//! - `argus:processed_job:<prefix>:<id>` - stage-scoped idempotency marker
//! - `argus:processing_lock:<id>` - exclusive processing lock
//! - `argus:circuit_breaker:<service>` - open-circuit marker
//! - `argus:metrics:<stage>:<name>` - monotonic counters
//!
//! Stage prefixes are plain strings so new stages never need a schema
//! change.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::cache::CacheStore;

/// Marker TTL for processed entities.
pub const PROCESSED_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Exclusive-lock TTL; crashed holders are recovered by expiry.
pub const LOCK_TTL: Duration = Duration::from_secs(10 * 60);
/// How long an opened circuit stays open.
pub const CIRCUIT_TTL: Duration = Duration::from_secs(5 * 60);

/// Stage prefix shared by discovery and the scrape worker (post ids).
pub const POST_STAGE_PREFIX: &str = "processed_job";

pub struct Deduplicator {
    store: Arc<dyn CacheStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn CacheStore> {
        Arc::clone(&self.store)
    }

    fn processed_key(prefix: &str, id: &str) -> String {
        format!("argus:processed_job:{prefix}:{id}")
    }

    fn lock_key(id: &str) -> String {
        format!("argus:processing_lock:{id}")
    }

    fn circuit_key(service: &str) -> String {
        format!("argus:circuit_breaker:{service}")
    }

    fn counter_key(stage: &str, name: &str) -> String {
        format!("argus:metrics:{stage}:{name}")
    }

    /// Marks an entity as durably handled by a stage.
    pub async fn mark(&self, prefix: &str, id: &str, ttl: Duration) -> Result<()> {
        self.store
            .set_ttl(&Self::processed_key(prefix, id), "1", ttl)
            .await
    }

    /// True when the entity was already handled by the stage.
    pub async fn processed(&self, prefix: &str, id: &str) -> Result<bool> {
        self.store.exists(&Self::processed_key(prefix, id)).await
    }

    /// Tries to take the exclusive processing lock for an entity.
    /// Callers must [`release`](Self::release) on every exit path; the TTL
    /// only covers crashed holders.
    pub async fn try_lock(&self, id: &str, ttl: Duration) -> Result<bool> {
        self.store.set_nx(&Self::lock_key(id), "1", ttl).await
    }

    /// Best-effort lock release.
    pub async fn release(&self, id: &str) {
        if let Err(e) = self.store.del(&Self::lock_key(id)).await {
            tracing::warn!(id, error = %e, "failed to release processing lock");
        }
    }

    pub async fn open_circuit(&self, service: &str, ttl: Duration) -> Result<()> {
        self.store
            .set_ttl(&Self::circuit_key(service), "1", ttl)
            .await
    }

    pub async fn circuit_open(&self, service: &str) -> Result<bool> {
        self.store.exists(&Self::circuit_key(service)).await
    }

    /// Best-effort counter increment; metrics never fail a handler.
    pub async fn incr(&self, stage: &str, name: &str) {
        if let Err(e) = self.store.incr(&Self::counter_key(stage, name)).await {
            tracing::warn!(stage, name, error = %e, "failed to increment counter");
        }
    }

    /// Current counter value, for tests and diagnostics.
    pub async fn counter(&self, stage: &str, name: &str) -> i64 {
        match self.store.get(&Self::counter_key(stage, name)).await {
            Ok(Some(v)) => v.parse().unwrap_or(0),
            _ => 0,
        }
    }
}
