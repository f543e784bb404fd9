//! Response streamer: turns a completion stream into posted reply messages.
//!
//! The streamer owns the per-reply state (redactor, thinking clock,
//! accumulated text) and drives a [`ReplySink`], the platform side that
//! creates, edits and deletes messages. Every message the sink creates gets
//! a claimed placeholder in the [`NodeCache`], so a user replying to a
//! half-written answer waits for the final text instead of reading a partial
//! one.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use replychain_core::channel::{ChatMessage, MessageId};
use replychain_core::error::ChannelError;
use replychain_core::provider::{ChunkReceiver, Usage};
use replychain_security::{PolicyVerdict, ResponsePolicy};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::context::{MessageNode, NodeCache, UserWarnings};
use crate::reasoning::ThinkRedactor;
use crate::reply::{
    self, FOOTER_CONTINUED_SUFFIX, FOOTER_STREAMING_SUFFIX, ReplyFrame, ReplyPage, ReplyStyle,
    STREAMING_INDICATOR, ThinkingClock,
};

/// The platform side of one reply.
#[async_trait]
pub trait ReplySink: Send {
    /// Post the warnings ahead of the reply. Returns the created message.
    async fn post_warnings(&mut self, warnings: &[String])
    -> Result<Option<MessageId>, ChannelError>;

    /// Bring the posted messages in line with `frame`. Returns the ids of
    /// messages created by this call, in page order.
    async fn render(&mut self, frame: &ReplyFrame) -> Result<Vec<MessageId>, ChannelError>;

    /// Delete everything posted so far and tell the user why.
    async fn abort(&mut self, reason: &str) -> Result<(), ChannelError>;

    /// Report a failed generation on the reply (or the trigger).
    async fn fail(&mut self, error: &str) -> Result<(), ChannelError>;
}

/// Per-reply settings.
#[derive(Debug, Clone)]
pub struct ReplySettings {
    pub style: ReplyStyle,
    /// `provider/model` shown in footers
    pub display_model: String,
    pub max_message_length: usize,
    pub edit_delay: Duration,
    /// Node cache size to prune back to once the reply is done
    pub max_message_nodes: usize,
}

impl ReplySettings {
    pub fn new(style: ReplyStyle, display_model: impl Into<String>) -> Self {
        Self {
            style,
            display_model: display_model.into(),
            max_message_length: style.max_message_length(),
            edit_delay: reply::EDIT_DELAY,
            max_message_nodes: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Completed {
        /// Full visible response
        text: String,
        /// Every message posted for the reply, warnings first
        message_ids: Vec<MessageId>,
        saw_reasoning: bool,
        usage: Option<Usage>,
    },
    /// The response policy stopped the reply; everything posted was deleted
    Blocked { reason: String },
}

/// Mutable state of one streamed reply.
struct StreamState {
    redactor: ThinkRedactor,
    clock: ThinkingClock,
    text: String,
    saw_reasoning: bool,
    usage: Option<Usage>,
    last_render: Option<Instant>,
    claimed: Vec<(MessageId, OwnedMutexGuard<MessageNode>)>,
}

enum Flow {
    Finished,
    Blocked(String),
}

pub struct ResponseStreamer<'a> {
    cache: &'a NodeCache,
    policy: &'a ResponsePolicy,
    settings: ReplySettings,
}

impl<'a> ResponseStreamer<'a> {
    pub fn new(cache: &'a NodeCache, policy: &'a ResponsePolicy, settings: ReplySettings) -> Self {
        Self {
            cache,
            policy,
            settings,
        }
    }

    /// Stream `chunks` into `sink` as the reply to `trigger`.
    pub async fn run(
        &self,
        trigger: &ChatMessage,
        warnings: &UserWarnings,
        mut chunks: ChunkReceiver,
        sink: &mut dyn ReplySink,
    ) -> replychain_core::Result<ReplyOutcome> {
        let mut state = StreamState {
            redactor: ThinkRedactor::new(),
            clock: ThinkingClock::new(Instant::now()),
            text: String::new(),
            saw_reasoning: false,
            usage: None,
            last_render: None,
            claimed: Vec::new(),
        };

        if self.settings.style == ReplyStyle::Embed && !warnings.is_empty() {
            match sink.post_warnings(&warnings.messages()).await {
                Ok(Some(id)) => self.claim(&mut state, trigger, vec![id]).await,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to post reply warnings"),
            }
        }

        let flow = match self.stream(trigger, &mut chunks, sink, &mut state).await {
            Ok(flow) => flow,
            Err(e) => {
                warn!(message_id = %trigger.id, error = %e, "Reply generation failed");
                if let Err(report) = sink.fail(&format!("Error during streaming: {e}")).await {
                    warn!(error = %report, "Failed to report generation error");
                }
                self.release(state, None).await;
                return Err(e);
            }
        };

        let outcome = match flow {
            Flow::Finished => {
                let message_ids: Vec<MessageId> = state.claimed.iter().map(|(id, _)| *id).collect();
                info!(
                    message_id = %trigger.id,
                    messages = message_ids.len(),
                    chars = state.text.chars().count(),
                    "Reply complete"
                );
                ReplyOutcome::Completed {
                    text: state.text.clone(),
                    message_ids,
                    saw_reasoning: state.saw_reasoning,
                    usage: state.usage,
                }
            }
            Flow::Blocked(reason) => {
                // Release the placeholders before deleting, evicting waits on them.
                let ids: Vec<MessageId> = state.claimed.drain(..).map(|(id, _)| id).collect();
                for id in ids {
                    self.cache.evict(id).await;
                }
                if let Err(e) = sink.abort(&reason).await {
                    warn!(error = %e, "Failed to abort blocked reply");
                }
                ReplyOutcome::Blocked { reason }
            }
        };

        let text = match &outcome {
            ReplyOutcome::Completed { text, .. } => Some(text.clone()),
            ReplyOutcome::Blocked { .. } => None,
        };
        self.release(state, text).await;
        Ok(outcome)
    }

    async fn stream(
        &self,
        trigger: &ChatMessage,
        chunks: &mut ChunkReceiver,
        sink: &mut dyn ReplySink,
        state: &mut StreamState,
    ) -> replychain_core::Result<Flow> {
        while let Some(item) = chunks.recv().await {
            let chunk = item?;
            if chunk.usage.is_some() {
                state.usage = chunk.usage;
            }

            let mut visible = String::new();
            if let Some(delta) = chunk.content.as_deref().filter(|d| !d.is_empty()) {
                let redacted = state.redactor.process(delta);
                if redacted.saw_reasoning {
                    state.saw_reasoning = true;
                    state
                        .clock
                        .mark_reasoning(Instant::now(), chrono::Utc::now().timestamp());
                }
                visible = redacted.visible;
            }

            let finished = chunk.is_finish();
            if finished {
                visible.push_str(&state.redactor.flush());
            }

            if !visible.is_empty() {
                state.clock.mark_output(Instant::now());
            }

            if visible.is_empty() && !finished && !state.clock.reasoning_started() {
                continue;
            }

            state.text.push_str(&visible);
            if let PolicyVerdict::Block { reason } = self.policy.check(&state.text) {
                return Ok(Flow::Blocked(reason));
            }

            if finished {
                debug!(reason = ?chunk.finish_reason, "Completion finished");
                return self.finish(trigger, sink, state).await;
            }

            let due = state
                .last_render
                .is_none_or(|at| at.elapsed() >= self.settings.edit_delay);
            if self.settings.style == ReplyStyle::Embed && due {
                if let Some(reason) = self.render(trigger, sink, state, false).await? {
                    return Ok(Flow::Blocked(reason));
                }
            }
        }

        // Stream closed without a finish chunk.
        let tail = state.redactor.flush();
        state.text.push_str(&tail);
        if let PolicyVerdict::Block { reason } = self.policy.check(&state.text) {
            return Ok(Flow::Blocked(reason));
        }
        self.finish(trigger, sink, state).await
    }

    async fn finish(
        &self,
        trigger: &ChatMessage,
        sink: &mut dyn ReplySink,
        state: &mut StreamState,
    ) -> replychain_core::Result<Flow> {
        match self.render(trigger, sink, state, true).await? {
            Some(reason) => Ok(Flow::Blocked(reason)),
            None => Ok(Flow::Finished),
        }
    }

    /// Render the current state. Returns a block reason if any page is
    /// refused by the response policy.
    async fn render(
        &self,
        trigger: &ChatMessage,
        sink: &mut dyn ReplySink,
        state: &mut StreamState,
        complete: bool,
    ) -> replychain_core::Result<Option<String>> {
        let frame = self.frame(state, complete);
        for page in &frame.pages {
            if let PolicyVerdict::Block { reason } = self.policy.check(&page.text) {
                return Ok(Some(reason));
            }
        }
        if frame.pages.iter().all(|p| p.text.is_empty()) && frame.style == ReplyStyle::Plain {
            return Ok(None);
        }

        let created = sink.render(&frame).await?;
        self.claim(state, trigger, created).await;
        state.last_render = Some(Instant::now());
        Ok(None)
    }

    fn frame(&self, state: &StreamState, complete: bool) -> ReplyFrame {
        let max_len = self.settings.max_message_length;
        match self.settings.style {
            ReplyStyle::Plain => ReplyFrame {
                style: ReplyStyle::Plain,
                pages: reply::paginate("", &state.text, max_len)
                    .into_iter()
                    .filter(|text| !text.is_empty())
                    .map(|text| ReplyPage { text, footer: None })
                    .collect(),
                complete,
            },
            ReplyStyle::Embed => {
                let mut body = state.text.clone();
                if !complete {
                    body.push_str(STREAMING_INDICATOR);
                }
                let rate = state
                    .clock
                    .tokens_per_second(Instant::now(), state.text.chars().count());
                let footer = reply::footer(&self.settings.display_model, rate);
                let pages = reply::paginate(&state.clock.header(), &body, max_len)
                    .into_iter()
                    .enumerate()
                    .map(|(i, text)| {
                        let suffix = match (complete, i) {
                            (false, _) => FOOTER_STREAMING_SUFFIX,
                            (true, 0) => "",
                            (true, _) => FOOTER_CONTINUED_SUFFIX,
                        };
                        ReplyPage {
                            text,
                            footer: Some(format!("{footer}{suffix}")),
                        }
                    })
                    .collect();
                ReplyFrame {
                    style: ReplyStyle::Embed,
                    pages,
                    complete,
                }
            }
        }
    }

    async fn claim(&self, state: &mut StreamState, trigger: &ChatMessage, ids: Vec<MessageId>) {
        for id in ids {
            let guard = self.cache.claim(id, trigger.clone()).await;
            state.claimed.push((id, guard));
        }
    }

    /// Store the final text in the placeholders (if any), unlock them and
    /// prune the cache.
    async fn release(&self, mut state: StreamState, text: Option<String>) {
        for (_, mut guard) in state.claimed.drain(..) {
            // Failed replies keep `None`, so a later walk re-reads them.
            guard.text = text.clone();
        }
        let pruned = self.cache.prune(self.settings.max_message_nodes).await;
        if pruned > 0 {
            debug!(pruned, "Node cache pruned after reply");
        }
    }
}
