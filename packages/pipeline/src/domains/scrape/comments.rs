//! Intercepted comment capture.
//!
//! The response interceptor runs on the CDP event task while the page
//! driver scrolls; both sides see the buffer, so appends are guarded and
//! the hard cap is enforced inside the critical section (viral posts can
//! stream thousands of comments).

use std::sync::Mutex;

use serde::Deserialize;

use crate::dto::RawComment;

/// Hard cap on captured comments per post.
pub const MAX_COMMENTS_PER_POST: usize = 200;

/// Wire shape of the platform's comment-list responses.
#[derive(Debug, Default, Deserialize)]
pub struct CommentListResponse {
    #[serde(default)]
    pub comments: Vec<CommentEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommentEntry {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub user: CommentUser,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommentUser {
    #[serde(default, rename = "unique_id")]
    pub handle: String,
}

/// Mutex-guarded, capped comment accumulator.
#[derive(Default)]
pub struct CommentBuffer {
    comments: Mutex<Vec<RawComment>>,
}

impl CommentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends entries from one intercepted response. Replies get the
    /// `[reply]` prefix. Returns how many entries were actually appended.
    pub fn absorb(&self, response: CommentListResponse, is_reply: bool) -> usize {
        let mut comments = self.comments.lock().unwrap_or_else(|e| e.into_inner());
        let mut appended = 0;
        for entry in response.comments {
            if comments.len() >= MAX_COMMENTS_PER_POST {
                break;
            }
            let text = entry.text.replace('\n', " ");
            comments.push(RawComment {
                handle: entry.user.handle,
                text: if is_reply {
                    format!("[reply] {text}")
                } else {
                    text
                },
            });
            appended += 1;
        }
        appended
    }

    pub fn len(&self) -> usize {
        self.comments.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<RawComment> {
        self.comments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(entries: &[(&str, &str)]) -> CommentListResponse {
        CommentListResponse {
            comments: entries
                .iter()
                .map(|(handle, text)| CommentEntry {
                    text: text.to_string(),
                    user: CommentUser {
                        handle: handle.to_string(),
                    },
                })
                .collect(),
        }
    }

    #[test]
    fn parses_platform_wire_shape() {
        let raw = r#"{"comments":[{"text":"join discord.gg/abc","user":{"unique_id":"alice"}}]}"#;
        let parsed: CommentListResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.comments.len(), 1);
        assert_eq!(parsed.comments[0].user.handle, "alice");
    }

    #[test]
    fn replies_are_prefixed_and_newlines_flattened() {
        let buffer = CommentBuffer::new();
        buffer.absorb(response(&[("bob", "line one\nline two")]), true);

        let captured = buffer.snapshot();
        assert_eq!(captured[0].handle, "bob");
        assert_eq!(captured[0].text, "[reply] line one line two");
    }

    #[test]
    fn cap_stops_the_201st_comment() {
        let buffer = CommentBuffer::new();
        let bulk: Vec<(String, String)> = (0..150)
            .map(|i| (format!("user{i}"), format!("text {i}")))
            .collect();
        let bulk_refs: Vec<(&str, &str)> = bulk
            .iter()
            .map(|(h, t)| (h.as_str(), t.as_str()))
            .collect();

        assert_eq!(buffer.absorb(response(&bulk_refs), false), 150);
        // second batch of 150 only fits 50 more
        assert_eq!(buffer.absorb(response(&bulk_refs), false), 50);
        assert_eq!(buffer.len(), MAX_COMMENTS_PER_POST);

        // and nothing past the cap, ever
        assert_eq!(buffer.absorb(response(&[("late", "nope")]), false), 0);
        assert_eq!(buffer.len(), MAX_COMMENTS_PER_POST);
    }
}
