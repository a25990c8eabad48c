//! Shared cache abstraction.
//!
//! Everything the pipeline keeps in the shared cache (markers, locks,
//! breaker state, counters) goes through [`CacheStore`], so handlers can
//! be exercised against [`MemoryStore`] without a cache server.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::RedisConfig;

/// String key-value store with TTL semantics.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Set a key with a TTL, overwriting any existing value.
    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Atomic set-if-absent with a TTL. Returns true when the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Atomic increment. Missing keys start at zero. No TTL.
    async fn incr(&self, key: &str) -> Result<i64>;
}

/// Production store over a shared connection manager.
///
/// The manager reconnects on its own; per-call clones are cheap handles
/// onto the same multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects and pings; failure here is fatal at service startup.
    pub async fn connect(cfg: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(cfg.url()).context("invalid redis url")?;
        let mut conn = ConnectionManager::new(client)
            .await
            .context("connecting to redis")?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .context("redis did not answer ping")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = conn.exists(key).await?;
        Ok(n > 0)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }
}

/// In-memory store for tests. TTLs are honored against a monotonic clock.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| t > Instant::now()).unwrap_or(true)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of live keys, for assertions.
    pub fn keys(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, e)| e.live())
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.lock();
        if entries.get(key).map(|e| e.live()).unwrap_or(false) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.lock().get(key).map(|e| e.live()).unwrap_or(false))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut entries = self.lock();
        let next = entries
            .get(key)
            .filter(|e| e.live())
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(0)
            + 1;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_set_nx_is_exclusive() {
        let store = MemoryStore::new();
        assert!(store.set_nx("k", "1", Duration::from_secs(60)).await.unwrap());
        assert!(!store.set_nx("k", "1", Duration::from_secs(60)).await.unwrap());

        store.del("k").await.unwrap();
        assert!(store.set_nx("k", "1", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_expires_entries() {
        let store = MemoryStore::new();
        store
            .set_ttl("gone", "1", Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!store.exists("gone").await.unwrap());
        // expired lock can be re-acquired
        assert!(store.set_nx("gone", "1", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_incr_is_monotonic() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.incr("c").await.unwrap(), 2);
        assert_eq!(store.get("c").await.unwrap().as_deref(), Some("2"));
    }
}
