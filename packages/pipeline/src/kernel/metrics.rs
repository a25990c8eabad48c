//! `/metrics` endpoint.
//!
//! Counters live in the shared cache (`argus:metrics:<stage>:<name>`), so
//! the endpoint is a read-only projection: each served request fetches the
//! current values and renders Prometheus text exposition format.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::cache::CacheStore;
use super::service_host::Service;

/// One exported metric backed by a cache key.
#[derive(Debug, Clone)]
pub struct MetricDef {
    pub cache_key: String,
    pub prom_name: String,
    pub help: String,
    pub kind: &'static str,
}

impl MetricDef {
    /// Counter under the standard pipeline namespace.
    pub fn counter(stage: &str, name: &str, help: &str) -> Self {
        Self {
            cache_key: format!("argus:metrics:{stage}:{name}"),
            prom_name: format!("argus_{stage}_{name}_total"),
            help: help.to_string(),
            kind: "counter",
        }
    }
}

struct MetricsState {
    store: Arc<dyn CacheStore>,
    defs: Vec<MetricDef>,
}

async fn render_metrics(State(state): State<Arc<MetricsState>>) -> String {
    let mut out = String::new();
    for def in &state.defs {
        let value = match state.store.get(&def.cache_key).await {
            Ok(Some(v)) => v,
            Ok(None) => "0".to_string(),
            Err(e) => {
                tracing::warn!(key = %def.cache_key, error = %e, "metrics read failed");
                "0".to_string()
            }
        };
        out.push_str(&format!("# HELP {} {}\n", def.prom_name, def.help));
        out.push_str(&format!("# TYPE {} {}\n", def.prom_name, def.kind));
        out.push_str(&format!("{} {}\n\n", def.prom_name, value));
    }
    out
}

/// Serves `/metrics` until the token is cancelled.
pub struct MetricsServer {
    port: u16,
    store: Arc<dyn CacheStore>,
    defs: Vec<MetricDef>,
}

impl MetricsServer {
    pub fn new(port: u16, store: Arc<dyn CacheStore>, defs: Vec<MetricDef>) -> Self {
        Self { port, store, defs }
    }
}

#[async_trait]
impl Service for MetricsServer {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let state = Arc::new(MetricsState {
            store: Arc::clone(&self.store),
            defs: self.defs.clone(),
        });
        let app = Router::new()
            .route("/metrics", get(render_metrics))
            .with_state(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding metrics listener on {addr}"))?;
        info!(%addr, "metrics server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("metrics server")?;
        Ok(())
    }
}
