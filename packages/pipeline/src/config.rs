//! Typed configuration loaded from YAML.
//!
//! The file is found via `CONFIG_PATH` or a short search path that covers
//! running from the repo root, a service directory, or a container image.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use directory_client::FetchMode;

const SEARCH_PATHS: &[&str] = &["config.yaml", "config/config.yaml", "../../config/config.yaml"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub meilisearch: MeilisearchConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    /// Passed through verbatim to the captcha collaborator.
    #[serde(default)]
    pub captcha: serde_yaml::Value,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub hashtags: Vec<String>,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_discovery_workers")]
    pub workers: usize,
    #[serde(default = "default_max_posts")]
    pub max_posts: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            hashtags: Vec::new(),
            interval_seconds: default_interval_seconds(),
            workers: default_discovery_workers(),
            max_posts: default_max_posts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_url")]
    pub url: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScraperConfig {
    #[serde(default = "default_scraper_workers")]
    pub workers: usize,
    #[serde(default = "default_browser_state_dir")]
    pub browser_state_dir: String,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            workers: default_scraper_workers(),
            browser_state_dir: default_browser_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_address")]
    pub address: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: default_redis_address(),
            password: String::new(),
            db: 0,
            ttl_hours: default_ttl_hours(),
        }
    }
}

impl RedisConfig {
    /// Connection URL in the form the redis client expects.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.address, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.address, self.db)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeilisearchConfig {
    #[serde(default = "default_meili_host")]
    pub host: String,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_meili_index")]
    pub index: String,
}

impl Default for MeilisearchConfig {
    fn default() -> Self {
        Self {
            host: default_meili_host(),
            key: String::new(),
            index: default_meili_index(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub fetch_mode: FetchMode,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_true")]
    pub headless: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Overrides the per-service default metrics port.
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_interval_seconds() -> u64 {
    30
}

fn default_discovery_workers() -> usize {
    2
}

fn default_max_posts() -> usize {
    150
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_scraper_workers() -> usize {
    1
}

fn default_browser_state_dir() -> String {
    "./browser_state".to_string()
}

fn default_redis_address() -> String {
    "localhost:6379".to_string()
}

fn default_ttl_hours() -> u64 {
    48
}

fn default_meili_host() -> String {
    "http://localhost:7700".to_string()
}

fn default_meili_index() -> String {
    "artifacts".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Loads configuration from `CONFIG_PATH` or the search path.
    pub fn load() -> Result<Self> {
        let path = Self::resolve_path().context("no config.yaml found; set CONFIG_PATH")?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "loading configuration");
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(cfg)
    }

    fn resolve_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CONFIG_PATH") {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        SEARCH_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }
}
