//! Reply rendering: pagination, the thinking header and footers.

use std::time::{Duration, Instant};

/// Appended to the body of unfinished embed frames.
pub const STREAMING_INDICATOR: &str = " ⚪";
pub const EMBED_DESCRIPTION_MAX_LENGTH: usize = 4096;
pub const PLAIN_MESSAGE_MAX_LENGTH: usize = 2000;
pub const EDIT_DELAY: Duration = Duration::from_secs(1);

pub const FOOTER_STREAMING_SUFFIX: &str = " • streaming...";
pub const FOOTER_CONTINUED_SUFFIX: &str = " • (cont.)";

/// How replies are posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStyle {
    /// Embeds, edited while the response streams in
    Embed,
    /// Plain messages, posted once the response is complete
    Plain,
}

impl ReplyStyle {
    pub fn from_plain_flag(use_plain_responses: bool) -> Self {
        if use_plain_responses {
            Self::Plain
        } else {
            Self::Embed
        }
    }

    /// Characters per posted message.
    pub fn max_message_length(&self) -> usize {
        match self {
            Self::Embed => EMBED_DESCRIPTION_MAX_LENGTH - STREAMING_INDICATOR.chars().count(),
            Self::Plain => PLAIN_MESSAGE_MAX_LENGTH,
        }
    }
}

/// One message worth of reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPage {
    pub text: String,
    /// Embed footer; plain pages have none
    pub footer: Option<String>,
}

/// The full desired state of the posted reply.
///
/// Sinks create messages for pages they have not posted yet and edit the
/// rest in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    pub style: ReplyStyle,
    pub pages: Vec<ReplyPage>,
    /// False while the response is still streaming
    pub complete: bool,
}

/// Split `body` into pages of at most `max_len` characters, with `header`
/// leading the first page.
///
/// Leading newlines of the body are dropped; the header and body are joined
/// with a newline when both are present.
pub fn paginate(header: &str, body: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let remaining = body.trim_start_matches('\n');

    let separator = usize::from(!header.is_empty() && !remaining.is_empty());
    let first_capacity = max_len.saturating_sub(header.chars().count() + separator);
    let (first, mut rest) = split_at_chars(remaining, first_capacity);

    let mut first_page = header.to_string();
    if !header.is_empty() && !first.is_empty() {
        first_page.push('\n');
    }
    first_page.push_str(first);

    let mut pages = vec![first_page];
    while !rest.is_empty() {
        let (chunk, tail) = split_at_chars(rest, max_len);
        pages.push(chunk.to_string());
        rest = tail;
    }
    pages
}

fn split_at_chars(text: &str, n: usize) -> (&str, &str) {
    match text.char_indices().nth(n) {
        Some((idx, _)) => text.split_at(idx),
        None => (text, ""),
    }
}

/// Tracks when reasoning and visible output started.
#[derive(Debug, Clone)]
pub struct ThinkingClock {
    started: Instant,
    reasoning: Option<(Instant, i64)>,
    output: Option<Instant>,
}

impl ThinkingClock {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            reasoning: None,
            output: None,
        }
    }

    /// First reasoning seen, at `now` / `unix_secs`. Later calls are ignored.
    pub fn mark_reasoning(&mut self, now: Instant, unix_secs: i64) {
        self.reasoning.get_or_insert((now, unix_secs));
    }

    /// First visible output seen. Later calls are ignored.
    pub fn mark_output(&mut self, now: Instant) {
        self.output.get_or_insert(now);
    }

    pub fn reasoning_started(&self) -> bool {
        self.reasoning.is_some()
    }

    pub fn output_started(&self) -> bool {
        self.output.is_some()
    }

    /// First-page header: a live timestamp while thinking, the duration after.
    pub fn header(&self) -> String {
        match (self.reasoning, self.output) {
            (Some((_, unix)), None) => format!("💭 Thinking since <t:{unix}:R>..."),
            (Some((since, _)), Some(output)) => {
                let secs = output.saturating_duration_since(since).as_secs();
                format!("💡 Done thinking! Took `{}m {}s`.", secs / 60, secs % 60)
            }
            (None, _) => String::new(),
        }
    }

    /// Rough throughput: four characters per token, measured from the first
    /// visible output (or the start, if there was none).
    pub fn tokens_per_second(&self, now: Instant, visible_chars: usize) -> f64 {
        let from = self.output.unwrap_or(self.started);
        let elapsed = now.saturating_duration_since(from).as_secs_f64().max(1e-6);
        visible_chars as f64 / 4.0 / elapsed
    }
}

/// `{model} • {rate} tok/s`
pub fn footer(display_model: &str, tokens_per_second: f64) -> String {
    format!("{display_model} • {tokens_per_second:.1} tok/s")
}
