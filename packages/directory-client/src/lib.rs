//! Client for the public chat-server invite directory.
//!
//! Two transports implement the same [`DirectoryProvider`] contract:
//! a token-less HTTP API client and a browser-rendered fallback used when
//! the HTTP endpoint is blocked. Both consult a shared positive cache so
//! repeated lookups of the same code never hit the directory twice within
//! the cache TTL.

mod browser;
mod error;
mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use browser::BrowserDirectoryClient;
pub use error::DirectoryError;
pub use http::HttpDirectoryClient;

/// How long a positive directory response stays cached.
pub const INVITE_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Guild block of a directory response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuildInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub icon: String,
}

/// A resolved invite as returned by the directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InviteInfo {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub guild: GuildInfo,
    #[serde(default)]
    pub approximate_member_count: i64,
    #[serde(default)]
    pub expires_at: Option<String>,
}

impl InviteInfo {
    /// CDN URL for the guild icon, or empty when the guild has none.
    pub fn icon_url(&self) -> String {
        if self.guild.icon.is_empty() {
            return String::new();
        }
        format!(
            "https://cdn.discordapp.com/icons/{}/{}.png",
            self.guild.id, self.guild.icon
        )
    }
}

/// Positive-response cache consulted and populated by both transports.
///
/// The pipeline backs this with the shared cache; tests use [`NoCache`].
#[async_trait]
pub trait InviteCache: Send + Sync {
    /// Returns the cached JSON payload for a code, if any.
    async fn fetch(&self, code: &str) -> Option<String>;
    /// Stores a JSON payload for a code. Best-effort.
    async fn store(&self, code: &str, payload: String, ttl: Duration);
}

/// Cache that never hits.
pub struct NoCache;

#[async_trait]
impl InviteCache for NoCache {
    async fn fetch(&self, _code: &str) -> Option<String> {
        None
    }

    async fn store(&self, _code: &str, _payload: String, _ttl: Duration) {}
}

/// Provider-agnostic directory lookup.
#[async_trait]
pub trait DirectoryProvider: Send + Sync {
    async fn get(&self, code: &str) -> Result<InviteInfo, DirectoryError>;
}

/// Transport selector, from the `discord.fetch_mode` config value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    #[default]
    Api,
    Browser,
}

/// Builds the provider selected by `fetch_mode`.
///
/// The browser transport launches its own headless instance, so this is
/// async and can fail on environments without a usable browser binary.
pub async fn new_provider(
    mode: FetchMode,
    proxy_url: Option<&str>,
    cache: Arc<dyn InviteCache>,
) -> anyhow::Result<Arc<dyn DirectoryProvider>> {
    match mode {
        FetchMode::Api => {
            tracing::info!(proxy = proxy_url.is_some(), "directory client: http api");
            Ok(Arc::new(HttpDirectoryClient::new(proxy_url, cache)?))
        }
        FetchMode::Browser => {
            tracing::info!("directory client: browser-rendered");
            Ok(Arc::new(BrowserDirectoryClient::launch(cache).await?))
        }
    }
}
