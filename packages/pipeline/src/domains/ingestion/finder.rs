//! Invite-link extraction from free text.
//!
//! Comment authors obfuscate links to dodge platform filters: spaces
//! around dots and slashes, "dot" spelled out, zero-width characters. The
//! finder normalizes those forms first, then matches the three link
//! shapes and returns canonical URLs, de-duplicated in first-seen order.

use regex::Regex;

pub struct InviteFinder {
    gg: Regex,
    invite: Regex,
    channels: Regex,
    dot_gg: Regex,
    dot_invite: Regex,
    dot_channels: Regex,
}

impl Default for InviteFinder {
    fn default() -> Self {
        Self::new()
    }
}

impl InviteFinder {
    pub fn new() -> Self {
        Self {
            gg: Regex::new(r"(?i)(?:https?://)?discord(?:\.|\s*dot\s*)gg\s*/\s*([a-zA-Z0-9-]{2,})")
                .expect("gg pattern"),
            invite: Regex::new(
                r"(?i)(?:https?://)?discord(?:\.|\s*dot\s*)com\s*/\s*invite\s*/\s*([a-zA-Z0-9-]{2,})",
            )
            .expect("invite pattern"),
            channels: Regex::new(
                r"(?i)(?:https?://)?discord(?:\.|\s*dot\s*)com\s*/\s*channels\s*/\s*([0-9]{5,})\s*/\s*([0-9]{5,})(?:\s*/\s*([0-9]{5,}))?",
            )
            .expect("channels pattern"),
            dot_gg: Regex::new(r"(?i)discord\s*\.\s*gg").expect("dot gg pattern"),
            dot_invite: Regex::new(r"(?i)discord\s*\.\s*com\s*/\s*invite").expect("dot invite"),
            dot_channels: Regex::new(r"(?i)discord\s*\.\s*com\s*/\s*channels").expect("dot channels"),
        }
    }

    /// Returns canonical link strings found in the text.
    pub fn find_invites(&self, text: &str) -> Vec<String> {
        let clean = self.normalize(text);

        let mut results = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut push = |value: String| {
            if seen.insert(value.clone()) {
                results.push(value);
            }
        };

        for captures in self.gg.captures_iter(&clean) {
            if let Some(code) = captures.get(1) {
                push(format!("discord.gg/{}", code.as_str()));
            }
        }
        for captures in self.invite.captures_iter(&clean) {
            if let Some(code) = captures.get(1) {
                push(format!("discord.com/invite/{}", code.as_str()));
            }
        }
        for captures in self.channels.captures_iter(&clean) {
            let (Some(guild), Some(channel)) = (captures.get(1), captures.get(2)) else {
                continue;
            };
            let mut link = format!(
                "discord.com/channels/{}/{}",
                guild.as_str(),
                channel.as_str()
            );
            if let Some(message) = captures.get(3) {
                link.push('/');
                link.push_str(message.as_str());
            }
            push(link);
        }

        results
    }

    fn normalize(&self, text: &str) -> String {
        let text = text.replace(['\u{200b}', '\u{feff}'], "");
        let text = self.dot_gg.replace_all(&text, "discord.gg");
        let text = self.dot_invite.replace_all(&text, "discord.com/invite");
        let text = self.dot_channels.replace_all(&text, "discord.com/channels");
        text.into_owned()
    }
}

/// Invite code for the link forms that carry one; channel permalinks are
/// surfaced by the finder but do not feed the enrichment pipeline.
pub fn code_from_link(link: &str) -> Option<String> {
    link.strip_prefix("discord.gg/")
        .or_else(|| link.strip_prefix("discord.com/invite/"))
        .map(str::to_string)
}
