//! Long-running service lifecycle.
//!
//! Each binary assembles its services and hands them to a [`ServiceHost`],
//! which runs them until SIGINT/SIGTERM, cancels the shared token, and
//! drains with a deadline. A service returning an error tears the whole
//! process down (exit non-zero); the orchestrator restarts it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(45);

/// A long-running task that honors cooperative cancellation.
///
/// `run` must return promptly once the token is cancelled; in-flight work
/// may finish first (unacked messages return to the broker regardless).
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run(&self, shutdown: CancellationToken) -> Result<()>;
}

pub struct ServiceHost {
    services: Vec<Arc<dyn Service>>,
    drain_deadline: Duration,
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            drain_deadline: DEFAULT_DRAIN_DEADLINE,
        }
    }

    pub fn with_service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }

    /// Runs all services until a termination signal or a service failure.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let token = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for service in self.services {
            let child = token.clone();
            tasks.spawn(async move {
                let name = service.name();
                info!(service = name, "service starting");
                (name, service.run(child).await)
            });
        }

        let mut first_error: Option<anyhow::Error> = None;
        let signal = shutdown_signal();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("termination signal received; draining services");
                    token.cancel();
                    break;
                }
                joined = tasks.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok((name, Ok(())))) => {
                            info!(service = name, "service finished");
                        }
                        Some(Ok((name, Err(e)))) => {
                            error!(service = name, error = %e, "service failed; shutting down");
                            first_error = Some(e);
                            token.cancel();
                            break;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "service task aborted");
                            first_error = Some(anyhow::anyhow!(e));
                            token.cancel();
                            break;
                        }
                    }
                }
            }
        }

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok((name, Err(e))) = joined {
                    warn!(service = name, error = %e, "service errored during drain");
                }
            }
        };
        if tokio::time::timeout(self.drain_deadline, drain).await.is_err() {
            warn!(deadline = ?self.drain_deadline, "drain deadline exceeded; aborting stragglers");
            tasks.abort_all();
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
