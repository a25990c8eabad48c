//! Captcha collaborator interface.
//!
//! The solving subsystem is an external collaborator: the pipeline only
//! needs presence detection and a bounded "make it go away" call. The
//! default [`PassiveResolver`] detects challenges heuristically and waits
//! for out-of-band resolution (an operator on the VNC session, or the
//! solver service acting on the same browser).

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chromiumoxide::Page;
use tracing::{debug, info};

/// Deadline applied by discovery and the scrape worker.
pub const CAPTCHA_DEADLINE: Duration = Duration::from_secs(5 * 60);

const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Markers that show up in challenge page URLs.
const URL_MARKERS: &[&str] = &["verify", "captcha"];

/// DOM probes for embedded challenges.
const SELECTOR_MARKERS: &[&str] = &[
    "iframe[src*='captcha']",
    ".captcha_verify_container",
    ".captcha_verify_img_slide",
    "[class*='captcha']",
    "[class*='secsdk-captcha']",
    "[id*='captcha']",
    "div[class*='verify']",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaOutcome {
    Resolved,
    TimedOut,
}

#[async_trait]
pub trait CaptchaResolver: Send + Sync {
    /// Whether a challenge is currently blocking the page.
    async fn is_present(&self, page: &Page) -> bool;

    /// Attempts to get the challenge out of the way within `deadline`.
    async fn handle(&self, page: &Page, deadline: Duration) -> Result<CaptchaOutcome>;
}

/// Detects challenges and polls until they disappear.
pub struct PassiveResolver;

#[async_trait]
impl CaptchaResolver for PassiveResolver {
    async fn is_present(&self, page: &Page) -> bool {
        if let Ok(Some(url)) = page.url().await {
            let lowered = url.to_lowercase();
            if URL_MARKERS.iter().any(|m| lowered.contains(m)) {
                debug!(url, "captcha marker in page url");
                return true;
            }
        }

        for selector in SELECTOR_MARKERS {
            let probe = tokio::time::timeout(Duration::from_secs(1), page.find_element(*selector));
            if matches!(probe.await, Ok(Ok(_))) {
                debug!(selector, "captcha marker element present");
                return true;
            }
        }

        false
    }

    async fn handle(&self, page: &Page, deadline: Duration) -> Result<CaptchaOutcome> {
        info!("captcha present; waiting for resolution");
        let started = tokio::time::Instant::now();
        loop {
            if started.elapsed() >= deadline {
                return Ok(CaptchaOutcome::TimedOut);
            }
            if !self.is_present(page).await {
                info!("captcha resolved");
                return Ok(CaptchaOutcome::Resolved);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
