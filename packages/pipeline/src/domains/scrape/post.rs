//! Per-post page driving: open, intercept, scroll, extract.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, GetResponseBodyParams,
};
use chromiumoxide::cdp::browser_protocol::page::ReloadParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::browser::captcha::{CaptchaOutcome, CaptchaResolver, CAPTCHA_DEADLINE};
use crate::browser::BrowserSession;
use crate::dto::{ArtifactMetadata, ArtifactPayload, RawComment, ScrapeJob};

use super::comments::{CommentBuffer, CommentListResponse, MAX_COMMENTS_PER_POST};

/// Hard kill for a wedged tab; automation beyond this point is hung.
pub const TAB_WATCHDOG: Duration = Duration::from_secs(8 * 60);

const NAVIGATE_TIMEOUT: Duration = Duration::from_secs(20);
const LOAD_TIMEOUT: Duration = Duration::from_secs(10);
/// Body fetches go through the CDP connection; a slow response must never
/// wedge the capture task.
const BODY_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub const SOURCE_TYPE: &str = "comment_intercept";

/// First selector that reacts wins; the platform rotates these.
const COMMENT_TOGGLE_SELECTORS: &[&str] = &[
    r#"[data-e2e="comment-icon"]"#,
    r#"[data-e2e="browse-comment"]"#,
    r#"button[aria-label*="omment"]"#,
    r#"strong[data-e2e="comment-count"]"#,
    r#"span[data-e2e="comment-count"]"#,
];

const COMMENT_COUNT_SELECTOR: &str =
    r#"strong[data-e2e="comment-count"], span[data-e2e="comment-count"]"#;

const REPLY_EXPANDER_SELECTORS: &str = r#"[data-e2e="view-more-replies"], [class*="SpanViewMoreReply"], span[class*="view-more"], [class*="DivViewRepliesContainer"]"#;

const DESCRIPTION_SELECTORS: &[&str] = &[
    r#"[data-e2e="browse-video-desc"]"#,
    r#"[data-e2e="video-desc"]"#,
    r#"[data-e2e="new-desc-paragraph"]"#,
];

const SCROLL_COMMENT_PANEL_JS: &str = r#"
(() => {
    const panel = document.querySelector(
        '[data-e2e="comment-list"], [class*="DivCommentListContainer"], [class*="CommentListScroller"]'
    );
    if (panel) { panel.scrollTop += 800; }
    else { window.scrollBy(0, 400); }
})()
"#;

/// Scroll passes for a given comment-count label: `4 + (count-20)/10`,
/// floor 4, ceiling 20.
pub fn scroll_budget(comment_count: i64) -> usize {
    if comment_count <= 20 {
        return 4;
    }
    let passes = 4 + (comment_count - 20) / 10;
    passes.min(20) as usize
}

/// Parses count labels like "342", "1.2K", "1,2K", "3M".
pub fn parse_count(label: &str) -> i64 {
    let mut s = label.trim().to_uppercase();
    if s.is_empty() {
        return 0;
    }

    let multiplier = if let Some(rest) = s.strip_suffix('K') {
        s = rest.to_string();
        1_000.0
    } else if let Some(rest) = s.strip_suffix('M') {
        s = rest.to_string();
        1_000_000.0
    } else if let Some(rest) = s.strip_suffix('B') {
        s = rest.to_string();
        1_000_000_000.0
    } else {
        1.0
    };

    let s = s.replace(',', ".");
    let value: f64 = s.trim().parse().unwrap_or(0.0);
    (value * multiplier) as i64
}

/// Collapses all whitespace runs to single spaces.
pub fn sanitize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `description` + one "@handle: text" line per comment.
pub fn compose_text(description: &str, comments: &[RawComment]) -> String {
    let lines: Vec<String> = comments
        .iter()
        .map(|c| format!("@{}: {}", c.handle, c.text))
        .collect();
    format!("{}\n{}", description, lines.join("\n"))
}

/// Opens a stealth tab for the job's post, captures comment-list traffic
/// while scrolling the comment panel, and composes the text artifact. The
/// tab is closed on every path; a watchdog bounds total tab lifetime.
pub async fn process_post(
    session: &BrowserSession,
    captcha: &dyn CaptchaResolver,
    job: &ScrapeJob,
) -> Result<ArtifactPayload> {
    let page = session.stealth_page().await?;
    let buffer = Arc::new(CommentBuffer::new());

    let capture_task = spawn_comment_capture(&page, Arc::clone(&buffer)).await;

    let driven = tokio::time::timeout(
        TAB_WATCHDOG,
        drive_post(&page, captcha, job, buffer.as_ref()),
    )
    .await;

    if let Some(task) = capture_task {
        task.abort();
    }
    if let Err(e) = page.close().await {
        debug!(video_id = %job.video_id, error = %e, "tab close failed");
    }

    let description = match driven {
        Err(_) => {
            warn!(video_id = %job.video_id, "tab watchdog fired; tab closed");
            anyhow::bail!("tab watchdog fired after {TAB_WATCHDOG:?} for {}", job.video_id);
        }
        Ok(Err(e)) => return Err(e),
        Ok(Ok(description)) => description,
    };

    let comments = buffer.snapshot();
    info!(
        video_id = %job.video_id,
        comments = comments.len(),
        description = %truncate(&description, 80),
        "post processed"
    );

    Ok(ArtifactPayload {
        source_path: job.video_url.clone(),
        text_content: compose_text(&description, &comments),
        author_id: None,
        source_type: SOURCE_TYPE.to_string(),
        metadata: ArtifactMetadata {
            comments,
            hashtag: job.hashtag.clone(),
            video_id: job.video_id.clone(),
        },
    })
}

/// Installs the comment-list interceptor on the page's network events.
async fn spawn_comment_capture(
    page: &Page,
    buffer: Arc<CommentBuffer>,
) -> Option<tokio::task::JoinHandle<()>> {
    if let Err(e) = page.execute(EnableParams::default()).await {
        warn!(error = %e, "could not enable network events; comments will not be captured");
        return None;
    }

    let mut events = match page.event_listener::<EventResponseReceived>().await {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "response listener unavailable; comments will not be captured");
            return None;
        }
    };

    let capture_page = page.clone();
    Some(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let url = event.response.url.as_str();
            let is_reply = url.contains("/comment/reply/");
            if !is_reply && !url.contains("/comment/list/") {
                continue;
            }
            if buffer.len() >= MAX_COMMENTS_PER_POST {
                continue;
            }

            let request = GetResponseBodyParams::new(event.request_id.clone());
            let body = match tokio::time::timeout(BODY_FETCH_TIMEOUT, capture_page.execute(request))
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    debug!(url, error = %e, "comment body unavailable");
                    continue;
                }
                Err(_) => {
                    debug!(url, "comment body fetch timed out");
                    continue;
                }
            };

            let raw: Vec<u8> = if body.result.base64_encoded {
                match base64::engine::general_purpose::STANDARD.decode(&body.result.body) {
                    Ok(bytes) => bytes,
                    Err(_) => continue,
                }
            } else {
                body.result.body.clone().into_bytes()
            };

            if let Ok(parsed) = serde_json::from_slice::<CommentListResponse>(&raw) {
                let appended = buffer.absorb(parsed, is_reply);
                debug!(url, appended, total = buffer.len(), "comments captured");
            }
        }
    }))
}

/// Navigates and works the page; returns the post description.
async fn drive_post(
    page: &Page,
    captcha: &dyn CaptchaResolver,
    job: &ScrapeJob,
    buffer: &CommentBuffer,
) -> Result<String> {
    tokio::time::timeout(NAVIGATE_TIMEOUT, page.goto(job.video_url.as_str()))
        .await
        .map_err(|_| anyhow::anyhow!("navigation timed out for {}", job.video_url))?
        .with_context(|| format!("navigating to {}", job.video_url))?;
    let _ = tokio::time::timeout(LOAD_TIMEOUT, page.wait_for_navigation()).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    // The first load sometimes races the client JS; one reload stabilizes
    // the DOM.
    if let Err(e) = page.execute(ReloadParams::default()).await {
        warn!(video_id = %job.video_id, error = %e, "reload failed");
    } else {
        let _ = tokio::time::timeout(LOAD_TIMEOUT, page.wait_for_navigation()).await;
    }
    tokio::time::sleep(Duration::from_secs(3)).await;

    clear_captcha(captcha, page, "initial_load").await?;

    // Open the comment panel.
    for selector in COMMENT_TOGGLE_SELECTORS {
        let found = tokio::time::timeout(Duration::from_secs(2), page.find_element(*selector));
        if let Ok(Ok(element)) = found.await {
            if element.click().await.is_ok() {
                break;
            }
        }
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut comment_count = 0;
    let count_probe =
        tokio::time::timeout(Duration::from_secs(2), page.find_element(COMMENT_COUNT_SELECTOR));
    if let Ok(Ok(element)) = count_probe.await {
        if let Ok(Some(label)) = element.inner_text().await {
            comment_count = parse_count(&label);
        }
    }

    let passes = scroll_budget(comment_count);
    debug!(video_id = %job.video_id, comment_count, passes, "scrolling comment panel");

    for pass in 0..passes {
        if buffer.len() >= MAX_COMMENTS_PER_POST {
            info!(video_id = %job.video_id, "comment cap reached; stopping scroll");
            break;
        }

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let _ = page.evaluate(SCROLL_COMMENT_PANEL_JS).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        let expanders =
            tokio::time::timeout(Duration::from_secs(5), page.find_elements(REPLY_EXPANDER_SELECTORS));
        if let Ok(Ok(elements)) = expanders.await {
            debug!(video_id = %job.video_id, pass, expanders = elements.len(), "expanding replies");
            for element in elements {
                let _ = element.click().await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }

        // The platform can throw a challenge mid-scroll.
        clear_captcha(captcha, page, "comment_scroll").await?;
    }

    tokio::time::sleep(Duration::from_secs(3)).await;

    Ok(extract_description(page).await)
}

async fn clear_captcha(captcha: &dyn CaptchaResolver, page: &Page, context: &str) -> Result<()> {
    if !captcha.is_present(page).await {
        return Ok(());
    }
    info!(context, "captcha detected; delegating");
    match captcha.handle(page, CAPTCHA_DEADLINE).await? {
        CaptchaOutcome::Resolved => {
            let _ = tokio::time::timeout(LOAD_TIMEOUT, page.wait_for_navigation()).await;
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(())
        }
        CaptchaOutcome::TimedOut => {
            anyhow::bail!("captcha unresolved after deadline ({context})")
        }
    }
}

/// Description via prioritized selectors: data attributes, then `h1`,
/// then the `og:description` meta tag.
async fn extract_description(page: &Page) -> String {
    for selector in DESCRIPTION_SELECTORS {
        let found = tokio::time::timeout(Duration::from_secs(2), page.find_element(*selector));
        if let Ok(Ok(element)) = found.await {
            if let Ok(Some(text)) = element.inner_text().await {
                if !text.is_empty() {
                    return sanitize(&text);
                }
            }
        }
    }

    let h1 = tokio::time::timeout(Duration::from_secs(2), page.find_element("h1"));
    if let Ok(Ok(element)) = h1.await {
        if let Ok(Some(text)) = element.inner_text().await {
            if !text.is_empty() {
                return sanitize(&text);
            }
        }
    }

    let meta = tokio::time::timeout(
        Duration::from_secs(1),
        page.find_element(r#"meta[property="og:description"]"#),
    );
    if let Ok(Ok(element)) = meta.await {
        if let Ok(Some(content)) = element.attribute("content").await {
            if !content.is_empty() {
                return sanitize(&content);
            }
        }
    }

    String::new()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}...")
}
