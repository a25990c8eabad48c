//! Token-less HTTP transport for the invite directory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::{DirectoryError, DirectoryProvider, InviteCache, InviteInfo, INVITE_CACHE_TTL};

const DIRECTORY_BASE: &str = "https://discord.com/api/v9/invites";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

pub struct HttpDirectoryClient {
    http: reqwest::Client,
    cache: Arc<dyn InviteCache>,
    proxied: bool,
}

impl HttpDirectoryClient {
    /// Builds the client, optionally routed through an outbound proxy.
    pub fn new(proxy_url: Option<&str>, cache: Arc<dyn InviteCache>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);

        let mut proxied = false;
        if let Some(url) = proxy_url.filter(|u| !u.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(url)?);
            proxied = true;
        }

        Ok(Self {
            http: builder.build()?,
            cache,
            proxied,
        })
    }
}

#[async_trait]
impl DirectoryProvider for HttpDirectoryClient {
    async fn get(&self, code: &str) -> Result<InviteInfo, DirectoryError> {
        if let Some(cached) = self.cache.fetch(code).await {
            if let Ok(info) = serde_json::from_str::<InviteInfo>(&cached) {
                debug!(code, "invite served from cache");
                return Ok(info);
            }
        }

        // Uniform 1-3s pre-request jitter so lookups never form a regular
        // pattern against the directory.
        let jitter_ms = rand::thread_rng().gen_range(1_000..=3_000);
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

        debug!(code, proxied = self.proxied, "directory lookup");

        let url = format!("{DIRECTORY_BASE}/{code}?with_counts=true");
        let response = self
            .http
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/json")
            .header("Accept-Language", "en-US,en;q=0.9")
            .send()
            .await
            .map_err(|e| DirectoryError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => return Err(DirectoryError::RateLimited),
            StatusCode::NOT_FOUND => return Err(DirectoryError::NotFound),
            status if !status.is_success() => return Err(DirectoryError::Status(status.as_u16())),
            _ => {}
        }

        let info: InviteInfo = response
            .json()
            .await
            .map_err(|e| DirectoryError::Parse(e.to_string()))?;

        match serde_json::to_string(&info) {
            Ok(payload) => self.cache.store(code, payload, INVITE_CACHE_TTL).await,
            Err(e) => warn!(code, error = %e, "could not serialize invite for cache"),
        }

        Ok(info)
    }
}
