//! Per-worker browser lifecycle.
//!
//! One worker process owns one long-lived browser with a persistent
//! profile directory (cookies and tokens survive restarts, which keeps
//! captcha pressure down). Tabs are created and closed per job.

pub mod captcha;
pub mod stealth;
pub mod sweeper;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::stealth::STEALTH_SCRIPTS;

const PAGE_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

/// Prefix for throwaway profiles, shared with the orphan sweeper.
pub const TEMP_PROFILE_PREFIX: &str = "argus_profile_";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Persistent profile directory for this worker instance.
    pub state_dir: PathBuf,
    pub headless: bool,
}

/// A launched browser plus its CDP event loop.
///
/// Shared across tasks behind an `Arc`; the mutex only guards the brief
/// CDP calls that need exclusive access (tab creation, close).
pub struct BrowserSession {
    browser: tokio::sync::Mutex<Browser>,
    handler_task: JoinHandle<()>,
}

impl BrowserSession {
    /// Launches with the persistent profile. If that profile cannot be
    /// launched (usually corruption from a hard kill), retries once with a
    /// throwaway profile in the temp dir; the sweeper reclaims those.
    pub async fn launch(config: &SessionConfig) -> Result<Self> {
        clean_stale_profile_locks(&config.state_dir);

        match Self::launch_with_dir(&config.state_dir, config.headless).await {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!(
                    dir = %config.state_dir.display(),
                    error = %e,
                    "persistent profile failed to launch; retrying with a clean temp profile"
                );
                let fallback = std::env::temp_dir().join(format!(
                    "{TEMP_PROFILE_PREFIX}{}",
                    uuid::Uuid::new_v4().simple()
                ));
                Self::launch_with_dir(&fallback, config.headless).await
            }
        }
    }

    async fn launch_with_dir(dir: &Path, headless: bool) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .user_data_dir(dir)
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--use-gl=swiftshader")
            .arg("--autoplay-policy=no-user-gesture-required")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");

        if !headless {
            builder = builder.with_head();
        }

        let browser_config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("launching browser")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        info!(dir = %dir.display(), headless, "browser launched");
        Ok(Self {
            browser: tokio::sync::Mutex::new(browser),
            handler_task,
        })
    }

    /// Opens a tab with the stealth fingerprint applied.
    pub async fn stealth_page(&self) -> Result<Page> {
        let page = {
            let browser = self.browser.lock().await;
            browser.new_page("about:blank").await.context("opening tab")?
        };

        page.execute(SetUserAgentOverrideParams::new(PAGE_USER_AGENT.to_string()))
            .await
            .context("setting user agent")?;
        apply_stealth(&page).await;

        Ok(page)
    }

    /// Closes the browser and stops the event loop.
    pub async fn close(&self) -> Result<()> {
        let result = self.browser.lock().await.close().await;
        self.handler_task.abort();
        result.map_err(|e| anyhow::anyhow!("closing browser: {e}"))?;
        Ok(())
    }
}

/// Re-applies the stealth scripts; call after navigation as well, since a
/// fresh document does not inherit them.
pub async fn apply_stealth(page: &Page) {
    for script in STEALTH_SCRIPTS {
        if let Err(e) = page.evaluate(script.to_string()).await {
            debug!(error = %e, "stealth script injection skipped");
        }
    }
}

/// Removes lock files a crashed browser leaves behind in the profile dir;
/// these otherwise make the next launch fail to get a debug URL.
pub fn clean_stale_profile_locks(dir: &Path) {
    for name in ["lockfile", "DevToolsActivePort"] {
        let path = dir.join(name);
        if path.exists() {
            match std::fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "removed stale profile lock"),
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove stale lock"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_locks_are_removed_and_profile_kept() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lockfile"), b"").unwrap();
        std::fs::write(dir.path().join("DevToolsActivePort"), b"9222").unwrap();
        std::fs::write(dir.path().join("Preferences"), b"{}").unwrap();

        clean_stale_profile_locks(dir.path());

        assert!(!dir.path().join("lockfile").exists());
        assert!(!dir.path().join("DevToolsActivePort").exists());
        assert!(dir.path().join("Preferences").exists());
    }

    #[test]
    fn clean_missing_dir_is_a_no_op() {
        clean_stale_profile_locks(Path::new("/nonexistent/profile/dir"));
    }
}
