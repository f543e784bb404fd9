//! Response policy: checks generated text before it reaches the channel.

use regex::Regex;
use replychain_config::AppConfig;
use tracing::{info, warn};

/// User-facing text shown when a reply is withheld by the block pattern.
pub const BLOCKED_MESSAGE: &str = "Response blocked by server policy.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    Allow,
    /// Stop the reply and show `reason` instead
    Block { reason: String },
}

impl PolicyVerdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Block { .. })
    }
}

/// Block pattern and length cap applied to the accumulated reply.
#[derive(Debug, Clone, Default)]
pub struct ResponsePolicy {
    block_pattern: Option<Regex>,
    length_cap: Option<usize>,
}

impl ResponsePolicy {
    pub fn new(block_pattern: Option<Regex>, length_cap: Option<usize>) -> Self {
        Self {
            block_pattern,
            length_cap: length_cap.filter(|cap| *cap > 0),
        }
    }

    /// An invalid pattern is logged and ignored rather than failing replies.
    pub fn from_config(config: &AppConfig) -> Self {
        let block_pattern = config
            .block_response_regex
            .as_deref()
            .filter(|p| !p.is_empty())
            .and_then(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern, error = %e, "Ignoring invalid block_response_regex");
                    None
                }
            });
        Self::new(block_pattern, config.reply_length_cap)
    }

    pub fn is_noop(&self) -> bool {
        self.block_pattern.is_none() && self.length_cap.is_none()
    }

    /// Check text about to be shown (the whole reply or one outgoing page).
    pub fn check(&self, text: &str) -> PolicyVerdict {
        if let Some(found) = self.block_pattern.as_ref().and_then(|re| re.find(text)) {
            info!(
                matched = %preview(found.as_str(), 120),
                preview = %preview(text, 200),
                "Reply blocked by pattern"
            );
            return PolicyVerdict::Block {
                reason: BLOCKED_MESSAGE.into(),
            };
        }

        if let Some(cap) = self.length_cap.filter(|cap| text.chars().count() >= *cap) {
            return PolicyVerdict::Block {
                reason: format!("Reply length exceeded the configured cap ({cap} characters)."),
            };
        }

        PolicyVerdict::Allow
    }
}

fn preview(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}… (truncated)", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_allows_everything() {
        let policy = ResponsePolicy::default();
        assert!(policy.is_noop());
        assert_eq!(policy.check("anything at all"), PolicyVerdict::Allow);
    }

    #[test]
    fn pattern_blocks_matching_text() {
        let policy = ResponsePolicy::new(Some(Regex::new(r"(?i)secret\s+code").unwrap()), None);
        assert!(policy.check("the Secret  Code is 42").is_blocked());
        assert!(!policy.check("nothing to see").is_blocked());
        assert_eq!(
            policy.check("secret code"),
            PolicyVerdict::Block {
                reason: BLOCKED_MESSAGE.into()
            }
        );
    }

    #[test]
    fn length_cap_counts_characters() {
        let policy = ResponsePolicy::new(None, Some(5));
        assert!(!policy.check("éééé").is_blocked());
        assert!(policy.check("ééééé").is_blocked());
        match policy.check("123456") {
            PolicyVerdict::Block { reason } => assert!(reason.contains("(5 characters)")),
            PolicyVerdict::Allow => panic!("expected block"),
        }
    }

    #[test]
    fn zero_cap_disables_the_check() {
        assert!(ResponsePolicy::new(None, Some(0)).is_noop());
    }

    #[test]
    fn invalid_config_pattern_is_ignored() {
        let config = AppConfig {
            block_response_regex: Some("(unclosed".into()),
            ..AppConfig::default()
        };
        assert!(ResponsePolicy::from_config(&config).is_noop());
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        assert_eq!(preview("héllo", 2), "hé… (truncated)");
        assert_eq!(preview("hi", 10), "hi");
    }
}
