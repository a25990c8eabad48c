//! Tag-listing source for the video platform.
//!
//! Renders the tag page in the persistent browser session, scrolls a
//! bounded number of times to trigger lazy loading, and collects post
//! links. Opening individual posts is the scrape worker's job.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::ReloadParams;
use chromiumoxide::Page;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::browser::captcha::{CaptchaOutcome, CaptchaResolver, CAPTCHA_DEADLINE};
use crate::browser::BrowserSession;

use super::source::{DiscoveredPost, ListingSource};

const TAG_URL_BASE: &str = "https://www.tiktok.com/tag";
const PLATFORM_HOST: &str = "tiktok.com";

const LOAD_TIMEOUT: Duration = Duration::from_secs(15);
const SCROLL_PASSES: usize = 8;

const COLLECT_LINKS_JS: &str =
    "Array.from(document.querySelectorAll('a')).map(a => a.href).filter(h => h)";

/// Matches `/<user>/video/<id>` post paths and captures the id.
fn post_link_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:https?://[^/]+)?/@?[^/]+/video/(\d+)(?:[/?#].*)?$").expect("post pattern")
    })
}

/// Filters raw hrefs down to unique post candidates, capped at `max`.
pub fn filter_post_links(hrefs: &[String], max: usize) -> Vec<DiscoveredPost> {
    let pattern = post_link_pattern();
    let mut seen = std::collections::HashSet::new();
    let mut posts = Vec::new();

    for href in hrefs {
        if posts.len() >= max {
            break;
        }
        let Some(captures) = pattern.captures(href) else {
            continue;
        };
        let Some(id) = captures.get(1) else { continue };
        if !seen.insert(href.clone()) {
            continue;
        }
        posts.push(DiscoveredPost {
            id: id.as_str().to_string(),
            url: href.clone(),
        });
    }

    posts
}

/// Last path segment, for direct post URLs.
pub fn extract_post_id(url: &str) -> String {
    let trimmed = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

pub struct TikTokSource {
    session: Arc<BrowserSession>,
    captcha: Arc<dyn CaptchaResolver>,
    max_posts: usize,
}

impl TikTokSource {
    pub fn new(
        session: Arc<BrowserSession>,
        captcha: Arc<dyn CaptchaResolver>,
        max_posts: usize,
    ) -> Self {
        Self {
            session,
            captcha,
            max_posts,
        }
    }

    async fn fetch_tag_page(&self, page: &Page, tag: &str) -> Result<Vec<DiscoveredPost>> {
        let tag_url = format!("{TAG_URL_BASE}/{tag}");
        info!(tag, url = %tag_url, "rendering tag listing");

        tokio::time::timeout(LOAD_TIMEOUT, page.goto(tag_url.as_str()))
            .await
            .map_err(|_| anyhow::anyhow!("navigation timed out for tag {tag}"))?
            .with_context(|| format!("navigating to {tag_url}"))?;
        let _ = tokio::time::timeout(LOAD_TIMEOUT, page.wait_for_navigation()).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        // Reload once to stabilize the listing before scrolling.
        if let Err(e) = page.execute(ReloadParams::default()).await {
            warn!(tag, error = %e, "listing reload failed");
        } else {
            let _ = tokio::time::timeout(LOAD_TIMEOUT, page.wait_for_navigation()).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        if self.captcha.is_present(page).await {
            match self.captcha.handle(page, CAPTCHA_DEADLINE).await? {
                CaptchaOutcome::Resolved => {
                    let _ = tokio::time::timeout(LOAD_TIMEOUT, page.wait_for_navigation()).await;
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
                CaptchaOutcome::TimedOut => {
                    anyhow::bail!("captcha unresolved on tag listing {tag}")
                }
            }
        }

        // Give the listing a chance to render at least one post link.
        let probe = tokio::time::timeout(LOAD_TIMEOUT, page.find_element(r#"a[href*="/video/"]"#));
        if !matches!(probe.await, Ok(Ok(_))) {
            debug!(tag, "no post links visible yet");
        }

        for pass in 0..SCROLL_PASSES {
            let _ = page.evaluate("window.scrollBy(0, 1200)").await;
            tokio::time::sleep(Duration::from_millis(1500)).await;
            if pass == 3 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        let _ = page.evaluate("window.scrollTo(0, 0)").await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let hrefs: Vec<String> = page
            .evaluate(COLLECT_LINKS_JS)
            .await
            .context("collecting listing links")?
            .into_value()
            .context("decoding listing links")?;

        let posts = filter_post_links(&hrefs, self.max_posts);
        info!(tag, candidates = posts.len(), raw_links = hrefs.len(), "listing collected");
        Ok(posts)
    }
}

#[async_trait]
impl ListingSource for TikTokSource {
    fn name(&self) -> &'static str {
        "tiktok-listing"
    }

    async fn fetch(&self, tag: &str) -> Result<Vec<DiscoveredPost>> {
        // A query that is already a post URL bypasses the listing.
        if tag.contains(PLATFORM_HOST) && tag.contains("/video/") {
            let id = extract_post_id(tag);
            debug!(tag, id, "direct post url query");
            return Ok(vec![DiscoveredPost {
                id,
                url: tag.to_string(),
            }]);
        }

        let page = self.session.stealth_page().await?;
        let result = self.fetch_tag_page(&page, tag).await;
        if let Err(e) = page.close().await {
            debug!(tag, error = %e, "listing tab close failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn filters_post_paths_only() {
        let hrefs = links(&[
            "https://www.tiktok.com/@alice/video/111",
            "https://www.tiktok.com/@alice",
            "https://www.tiktok.com/tag/fun",
            "https://www.tiktok.com/@bob/video/222?lang=en",
            "https://other.site/@x/video/333",
        ]);
        let posts = filter_post_links(&hrefs, 150);
        assert_eq!(
            posts.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["111", "222", "333"]
        );
    }

    #[test]
    fn dedupes_by_url_and_caps() {
        let mut hrefs = Vec::new();
        for i in 0..200 {
            hrefs.push(format!("https://www.tiktok.com/@u/video/{i}"));
            hrefs.push(format!("https://www.tiktok.com/@u/video/{i}"));
        }
        let posts = filter_post_links(&hrefs, 150);
        assert_eq!(posts.len(), 150);
        assert_eq!(posts[0].id, "0");
        assert_eq!(posts[149].id, "149");
    }

    #[test]
    fn extracts_id_from_direct_urls() {
        assert_eq!(
            extract_post_id("https://www.tiktok.com/@alice/video/12345"),
            "12345"
        );
        assert_eq!(
            extract_post_id("https://www.tiktok.com/@alice/video/12345?is_copy=1"),
            "12345"
        );
        assert_eq!(
            extract_post_id("https://www.tiktok.com/@alice/video/12345/"),
            "12345"
        );
    }
}
