//! System prompt formatting and completion request building.

use std::fmt::Display;

use chrono::{DateTime, TimeZone};
use replychain_core::channel::Author;
use replychain_core::message::Turn;
use replychain_core::provider::ProviderRequest;
use serde_json::{Map, Value};

use crate::context::AssembledContext;

pub const USERNAME_INSTRUCTIONS: &str =
    "User's names are their Discord IDs and should be typed as '<@ID>'.";

/// Expand a system prompt template.
///
/// `{date}` and `{time}` come from `now`, `{users}` from `users_listing`.
/// Returns `None` for an empty template.
pub fn format_system_prompt<Tz>(
    template: &str,
    now: &DateTime<Tz>,
    accept_usernames: bool,
    users_listing: Option<&str>,
) -> Option<String>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    if template.is_empty() {
        return None;
    }

    let mut formatted = template
        .replace("{date}", &now.format("%B %d %Y").to_string())
        .replace("{time}", &now.format("%H:%M:%S %Z%z").to_string())
        .trim()
        .to_string();

    if formatted.contains("{users}") {
        formatted = formatted.replace("{users}", users_listing.unwrap_or_default());
    }

    if accept_usernames {
        formatted.push('\n');
        formatted.push_str(USERNAME_INSTRUCTIONS);
    }

    (!formatted.is_empty()).then_some(formatted)
}

/// One line per guild member, for the `{users}` placeholder.
pub fn users_listing(members: &[Author]) -> String {
    members
        .iter()
        .map(|m| {
            format!(
                "username: {}, nickname: {}, mention: {}",
                m.name,
                m.display_name(),
                m.id.mention()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Completion request for an assembled context: system turn first, then the
/// conversation oldest first.
pub fn build_completion_request(
    model: &str,
    context: &AssembledContext,
    system_prompt: Option<String>,
    extra_body: Map<String, Value>,
) -> ProviderRequest {
    let mut messages = Vec::with_capacity(context.len() + 1);
    if let Some(prompt) = system_prompt {
        messages.push(Turn::system(prompt));
    }
    messages.extend(context.chronological());

    ProviderRequest {
        model: model.to_string(),
        messages,
        extra_body,
        ..ProviderRequest::default()
    }
}
