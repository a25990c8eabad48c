//! Browser-rendered transport for the invite directory.
//!
//! Used when the token-less HTTP endpoint is blocked: loads the public
//! invite page in a headless tab, aborts the app deep-link redirect, and
//! scrapes the `og:*` meta tags plus the on-page member count.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, ContinueRequestParams, EventRequestPaused, FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::network::ErrorReason;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{DirectoryError, DirectoryProvider, InviteCache, InviteInfo, INVITE_CACHE_TTL};

const INVITE_PAGE_BASE: &str = "https://discord.com/invite";

/// Extracts guild fields from the rendered invite page. Falls back from
/// the `h1` heading to the `og:title`, and from visible member-count text
/// to the `og:description`. Generic page titles mean the invite resolved
/// to nothing.
const SCRAPE_SCRIPT: &str = r#"
(() => {
    let name = "";
    let icon = "";
    let memberCount = 0;
    let guildId = "unknown";

    const h1 = document.querySelector('h1');
    if (h1 && h1.innerText && h1.innerText.trim() !== "") {
        name = h1.innerText.trim();
    }

    for (const el of document.querySelectorAll('div, span, strong')) {
        if (!el.innerText) continue;
        const m = el.innerText.match(/([\d.,]+)\s+Members/i);
        if (m) {
            memberCount = parseInt(m[1].replace(/[,.]/g, ''));
            break;
        }
    }

    const metaTitle = document.querySelector('meta[property="og:title"]');
    if (metaTitle && metaTitle.content && name === "") {
        name = metaTitle.content
            .replace("Join the ", "")
            .replace(" Discord Server!", "")
            .trim();
    }

    const metaDesc = document.querySelector('meta[property="og:description"]');
    if (metaDesc && metaDesc.content && memberCount === 0) {
        const m = metaDesc.content.match(/with\s+([\d.,]+)\s+other members/i);
        if (m) {
            memberCount = parseInt(m[1].replace(/[,.]/g, ''));
        }
    }

    const metaImg = document.querySelector('meta[property="og:image"]');
    if (metaImg && metaImg.content) {
        const m = metaImg.content.match(/icons\/(\d+)\/([a-zA-Z0-9_]+)\./);
        if (m) {
            guildId = m[1];
            icon = m[2];
        }
    }

    const genericTitles = [
        "Discord - Group Chat That's All Fun & Games",
        "Discord",
        "Invite Invalid",
        "Opening Discord App."
    ];
    const invalid = name === "" || genericTitles.includes(name);

    return { name, icon, memberCount, guildId, invalid };
})()
"#;

#[derive(Debug, Deserialize)]
struct ScrapedInvite {
    name: String,
    icon: String,
    #[serde(rename = "memberCount")]
    member_count: i64,
    #[serde(rename = "guildId")]
    guild_id: String,
    invalid: bool,
}

pub struct BrowserDirectoryClient {
    browser: Browser,
    cache: Arc<dyn InviteCache>,
}

impl BrowserDirectoryClient {
    /// Launches a dedicated headless browser for invite-page rendering.
    pub async fn launch(cache: Arc<dyn InviteCache>) -> anyhow::Result<Self> {
        let config = BrowserConfig::builder()
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .build()
            .map_err(|e| anyhow::anyhow!("browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config).await?;
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Self { browser, cache })
    }

    async fn render_invite(&self, code: &str) -> Result<InviteInfo, DirectoryError> {
        let url = format!("{INVITE_PAGE_BASE}/{code}");

        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| DirectoryError::Browser(e.to_string()))?;

        // The invite page immediately tries to hand off to the installed
        // app via a discord:// navigation; abort those requests so the
        // rendered HTML stays up.
        if let Err(e) = page.execute(fetch::EnableParams::default()).await {
            warn!(code, error = %e, "could not enable request interception");
        }
        let interceptor = match page.event_listener::<EventRequestPaused>().await {
            Ok(mut paused) => {
                let intercept_page = page.clone();
                Some(tokio::spawn(async move {
                    while let Some(event) = paused.next().await {
                        let request_id = event.request_id.clone();
                        let result = if event.request.url.starts_with("discord://") {
                            intercept_page
                                .execute(FailRequestParams::new(request_id, ErrorReason::Aborted))
                                .await
                                .map(|_| ())
                        } else {
                            intercept_page
                                .execute(ContinueRequestParams::new(request_id))
                                .await
                                .map(|_| ())
                        };
                        if result.is_err() {
                            break;
                        }
                    }
                }))
            }
            Err(e) => {
                warn!(code, error = %e, "request-paused listener unavailable");
                None
            }
        };

        let scrape = async {
            page.goto(url.as_str())
                .await
                .map_err(|e| DirectoryError::Browser(e.to_string()))?;
            let _ = page.wait_for_navigation().await;
            tokio::time::sleep(Duration::from_secs(1)).await;

            let result = page
                .evaluate(SCRAPE_SCRIPT)
                .await
                .map_err(|e| DirectoryError::Browser(e.to_string()))?;
            let scraped: ScrapedInvite = result
                .into_value()
                .map_err(|e| DirectoryError::Parse(e.to_string()))?;

            if scraped.invalid {
                return Err(DirectoryError::NotFound);
            }

            let mut info = InviteInfo {
                code: code.to_string(),
                approximate_member_count: scraped.member_count,
                ..Default::default()
            };
            info.guild.id = scraped.guild_id;
            info.guild.name = scraped.name;
            info.guild.icon = scraped.icon;
            Ok(info)
        }
        .await;

        if let Some(task) = interceptor {
            task.abort();
        }
        if let Err(e) = page.close().await {
            debug!(code, error = %e, "invite tab close failed");
        }

        scrape
    }
}

#[async_trait]
impl DirectoryProvider for BrowserDirectoryClient {
    async fn get(&self, code: &str) -> Result<InviteInfo, DirectoryError> {
        if let Some(cached) = self.cache.fetch(code).await {
            if let Ok(info) = serde_json::from_str::<InviteInfo>(&cached) {
                debug!(code, "invite served from cache");
                return Ok(info);
            }
        }

        // Pace page loads the same way the HTTP transport paces requests.
        tokio::time::sleep(Duration::from_secs(3)).await;

        let info = self.render_invite(code).await?;

        match serde_json::to_string(&info) {
            Ok(payload) => self.cache.store(code, payload, INVITE_CACHE_TTL).await,
            Err(e) => warn!(code, error = %e, "could not serialize invite for cache"),
        }

        Ok(info)
    }
}
