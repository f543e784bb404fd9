//! Posts a streamed reply to Discord.
//!
//! Pages go out as silent replies, each chained to the message before it so
//! long answers read top to bottom. Embed pages are edited in place as the
//! response grows; a page is only re-sent when its payload changed.

use async_trait::async_trait;
use replychain_agent::{ReplyFrame, ReplyPage, ReplySink, ReplyStyle};
use replychain_core::channel::{ChannelId, ChatMessage, MessageId};
use replychain_core::error::ChannelError;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::discord::DiscordRest;

/// Discord's `dark_green`
pub const EMBED_COLOR_COMPLETE: u32 = 0x1F8B4C;
/// Discord's `orange`
pub const EMBED_COLOR_INCOMPLETE: u32 = 0xE67E22;
/// Discord's `red`
pub const EMBED_COLOR_ERROR: u32 = 0xE74C3C;

/// `SUPPRESS_NOTIFICATIONS` message flag
const SILENT_FLAG: u64 = 1 << 12;

pub struct DiscordReplySink<'a> {
    rest: &'a DiscordRest,
    channel_id: ChannelId,
    trigger: MessageId,
    warnings: Option<MessageId>,
    /// Posted pages with the payload they currently show
    pages: Vec<(MessageId, Value)>,
}

impl<'a> DiscordReplySink<'a> {
    pub fn new(rest: &'a DiscordRest, trigger: &ChatMessage) -> Self {
        Self {
            rest,
            channel_id: trigger.channel.id,
            trigger: trigger.id,
            warnings: None,
            pages: Vec::new(),
        }
    }

    /// Ids of the reply pages posted so far.
    pub fn page_ids(&self) -> Vec<MessageId> {
        self.pages.iter().map(|(id, _)| *id).collect()
    }

    /// The message a new page should reply to.
    fn reply_target(&self) -> MessageId {
        self.pages
            .last()
            .map(|(id, _)| *id)
            .or(self.warnings)
            .unwrap_or(self.trigger)
    }

    async fn post_reply(
        &self,
        payload: Value,
        reply_to: MessageId,
    ) -> Result<MessageId, ChannelError> {
        self.rest
            .create_message(self.channel_id, &as_silent_reply(payload, reply_to))
            .await
    }
}

#[async_trait]
impl ReplySink for DiscordReplySink<'_> {
    async fn post_warnings(
        &mut self,
        warnings: &[String],
    ) -> Result<Option<MessageId>, ChannelError> {
        if warnings.is_empty() {
            return Ok(None);
        }
        let id = self.post_reply(warnings_payload(warnings), self.trigger).await?;
        self.warnings = Some(id);
        Ok(Some(id))
    }

    async fn render(&mut self, frame: &ReplyFrame) -> Result<Vec<MessageId>, ChannelError> {
        let mut created = Vec::new();

        for (i, page) in frame.pages.iter().enumerate() {
            let payload = page_payload(frame.style, page, frame.complete);
            match self.pages.get_mut(i) {
                Some((id, shown)) => {
                    if *shown != payload {
                        self.rest.edit_message(self.channel_id, *id, &payload).await?;
                        *shown = payload;
                    }
                }
                None => {
                    let id = self.post_reply(payload.clone(), self.reply_target()).await?;
                    self.pages.push((id, payload));
                    created.push(id);
                }
            }
        }

        // Dropping the streaming indicator can shorten the reply by a page.
        while self.pages.len() > frame.pages.len().max(1) {
            if let Some((id, _)) = self.pages.pop() {
                debug!(message_id = %id, "Removing surplus reply page");
                self.rest.delete_message(self.channel_id, id).await?;
            }
        }

        Ok(created)
    }

    async fn abort(&mut self, reason: &str) -> Result<(), ChannelError> {
        let posted: Vec<MessageId> = self
            .warnings
            .take()
            .into_iter()
            .chain(self.pages.drain(..).map(|(id, _)| id))
            .collect();
        for id in posted {
            if let Err(e) = self.rest.delete_message(self.channel_id, id).await {
                warn!(message_id = %id, error = %e, "Failed to delete aborted reply");
            }
        }
        self.post_reply(error_payload(reason), self.trigger).await?;
        Ok(())
    }

    async fn fail(&mut self, error: &str) -> Result<(), ChannelError> {
        let payload = error_payload(error);
        match self.pages.last_mut() {
            Some((id, shown)) => {
                self.rest.edit_message(self.channel_id, *id, &payload).await?;
                *shown = payload;
            }
            None => {
                self.post_reply(payload, self.trigger).await?;
            }
        }
        Ok(())
    }
}

fn as_silent_reply(mut payload: Value, reply_to: MessageId) -> Value {
    if let Some(object) = payload.as_object_mut() {
        object.insert(
            "message_reference".into(),
            json!({ "message_id": reply_to.to_string(), "fail_if_not_exists": false }),
        );
        object.insert("flags".into(), json!(SILENT_FLAG));
    }
    payload
}

fn page_payload(style: ReplyStyle, page: &ReplyPage, complete: bool) -> Value {
    match style {
        ReplyStyle::Plain => json!({ "content": page.text }),
        ReplyStyle::Embed => {
            let color = if complete {
                EMBED_COLOR_COMPLETE
            } else {
                EMBED_COLOR_INCOMPLETE
            };
            let mut embed = json!({ "description": page.text, "color": color });
            if let Some(footer) = &page.footer {
                embed["footer"] = json!({ "text": footer });
            }
            json!({ "embeds": [embed] })
        }
    }
}

fn warnings_payload(warnings: &[String]) -> Value {
    let fields: Vec<Value> = warnings
        .iter()
        .map(|w| json!({ "name": w, "value": "", "inline": false }))
        .collect();
    json!({ "embeds": [{ "fields": fields }] })
}

fn error_payload(text: &str) -> Value {
    json!({ "embeds": [{ "description": text, "color": EMBED_COLOR_ERROR }] })
}
