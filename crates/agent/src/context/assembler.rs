//! Conversation context assembly.
//!
//! Walks the reply/continuation chain backwards from the triggering message,
//! newest first, and turns each message into at most one [`Turn`]:
//!
//! 1. **Lock** the message's node in the [`NodeCache`]
//! 2. **Populate** it on first visit (clean the body, download attachments,
//!    resolve the parent)
//! 3. **Render** a turn under the text/image budgets
//! 4. **Warn** about anything that was cut or skipped
//! 5. **Advance** to the parent and release the lock
//!
//! The walk stops at the turn budget, at a message without a parent, or at a
//! message it has already visited.
//!
//! # Parent resolution
//!
//! Run once per node, in this order:
//!
//! | Case | Parent |
//! |------|--------|
//! | No reference, bot not mentioned, previous message is ordinary and from the expected author | The previous message |
//! | Public thread off a text channel, no reference | The thread's starter message |
//! | Explicit reference | The cached copy, else a fetch |
//!
//! The expected author of an implicit continuation is the bot in a DM and
//! the same user everywhere else. Failures while resolving are logged and
//! recorded on the node; the chain simply ends there.

use std::collections::HashSet;

use base64::Engine;
use futures::future::try_join_all;
use replychain_core::channel::{
    Attachment, AttachmentFetcher, ChannelKind, ChatMessage, Embed, MessageAccessor, MessageId,
    UserId,
};
use replychain_core::error::{ChannelError, ContextError};
use replychain_core::message::{ContentPart, Role, Turn, TurnContent};
use tracing::{debug, warn};

use crate::context::node_cache::{MessageNode, NodeCache};
use crate::context::warnings::{UserWarnings, Warning};

// ── Types ─────────────────────────────────────────────────────────────────

/// Budgets applied while rendering turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    /// Maximum number of turns (N)
    pub max_turns: usize,
    /// Maximum characters of text per turn (T)
    pub max_text: usize,
    /// Maximum images per turn (M)
    pub max_images: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_turns: 25,
            max_text: 100_000,
            max_images: 5,
        }
    }
}

/// What the selected model can take, plus formatting switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextFlags {
    pub accept_images: bool,
    /// Tag user turns with the author's id
    pub accept_usernames: bool,
    /// Prefix user text with `"{display name}: "`
    pub prefix_display_names: bool,
}

/// Collaborators for a single assembly.
pub struct AssemblyInput<'a> {
    /// The triggering message
    pub message: &'a ChatMessage,
    pub cache: &'a NodeCache,
    pub accessor: &'a dyn MessageAccessor,
    pub fetcher: &'a dyn AttachmentFetcher,
}

/// Result of a walk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    /// Turns, newest first
    pub turns: Vec<Turn>,
    pub warnings: UserWarnings,
}

impl AssembledContext {
    /// Turns oldest first, the order a completion request wants.
    pub fn chronological(&self) -> Vec<Turn> {
        self.turns.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

// ── Assembler ─────────────────────────────────────────────────────────────

/// Builds the turn list for one triggering message.
///
/// Holds no mutable state of its own; the node cache is passed in per call,
/// so one assembler can serve any number of concurrent walks.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    bot_id: UserId,
    limits: ContextLimits,
    flags: ContextFlags,
}

impl ContextAssembler {
    pub fn new(bot_id: UserId, limits: ContextLimits, flags: ContextFlags) -> Self {
        Self {
            bot_id,
            limits,
            flags,
        }
    }

    pub fn limits(&self) -> &ContextLimits {
        &self.limits
    }

    pub fn flags(&self) -> &ContextFlags {
        &self.flags
    }

    /// Images are only rendered for models that can take them.
    fn image_budget(&self) -> usize {
        if self.flags.accept_images {
            self.limits.max_images
        } else {
            0
        }
    }

    /// Walk the chain starting at `input.message`.
    ///
    /// Fails only when an attachment download fails; the affected node is
    /// left unpopulated so the next walk tries again.
    pub async fn assemble(
        &self,
        input: &AssemblyInput<'_>,
    ) -> Result<AssembledContext, ContextError> {
        let mut turns: Vec<Turn> = Vec::new();
        let mut warnings = UserWarnings::new();
        let mut visited: HashSet<MessageId> = HashSet::new();
        let mut cursor = Some(input.message.clone());

        while turns.len() < self.limits.max_turns {
            let Some(message) = cursor.take() else {
                break;
            };
            if !visited.insert(message.id) {
                warn!(message_id = %message.id, "Reply chain loops back on itself; stopping");
                break;
            }

            let handle = input.cache.get_or_create(message.id);
            let mut node = handle.lock().await;

            if !node.is_populated() {
                self.populate(&mut node, &message, input).await?;
            }

            if let Some(turn) = self.render_turn(&node) {
                turns.push(turn);
            }
            self.collect_warnings(&node, turns.len(), &mut warnings);

            cursor = node.parent.clone();
        }

        debug!(
            message_id = %input.message.id,
            turns = turns.len(),
            warnings = warnings.len(),
            "Context assembled"
        );

        Ok(AssembledContext { turns, warnings })
    }

    // ── Population ────────────────────────────────────────────────────────

    async fn populate(
        &self,
        node: &mut MessageNode,
        message: &ChatMessage,
        input: &AssemblyInput<'_>,
    ) -> Result<(), ContextError> {
        let supported: Vec<&Attachment> = message
            .attachments
            .iter()
            .filter(|a| a.is_supported())
            .collect();

        let fetched = try_join_all(supported.iter().map(|a| input.fetcher.fetch(a)))
            .await
            .map_err(|source| {
                warn!(message_id = %message.id, error = %source, "Attachment download failed");
                ContextError::Attachment {
                    message_id: message.id,
                    source,
                }
            })?;

        let body = message.content_without_mention(self.bot_id);
        let mut sections: Vec<String> = Vec::new();
        if !body.is_empty() {
            sections.push(body.to_string());
        }
        sections.extend(
            message
                .embeds
                .iter()
                .map(Embed::summary)
                .filter(|s| !s.is_empty()),
        );

        let mut images = Vec::new();
        for (attachment, file) in supported.iter().zip(&fetched) {
            if attachment.is_text() {
                sections.push(String::from_utf8_lossy(&file.bytes).into_owned());
            } else if attachment.is_image() {
                let content_type = attachment
                    .content_type
                    .as_deref()
                    .unwrap_or(&file.content_type);
                images.push(ContentPart::image_url(data_uri(content_type, &file.bytes)));
            }
        }

        let is_bot = message.author.id == self.bot_id;
        let parent = self.resolve_parent(message, input.accessor).await;

        node.images = images;
        node.role = if is_bot { Role::Assistant } else { Role::User };
        node.author_id = (!is_bot).then_some(message.author.id);
        node.display_name = (!is_bot).then(|| message.author.display_name().to_string());
        node.has_unsupported_attachments = message.attachments.len() > supported.len();
        match parent {
            Ok(parent) => node.parent = parent,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Failed to resolve parent message");
                node.parent = None;
                node.parent_fetch_failed = true;
            }
        }
        node.text = Some(sections.join("\n"));

        Ok(())
    }

    async fn resolve_parent(
        &self,
        message: &ChatMessage,
        accessor: &dyn MessageAccessor,
    ) -> Result<Option<ChatMessage>, ChannelError> {
        if message.reference.is_none() && !message.mentions_user(self.bot_id) {
            let expected_author = if message.is_private() {
                self.bot_id
            } else {
                message.author.id
            };
            if let Some(previous) = accessor.fetch_previous(message).await? {
                if previous.kind.is_ordinary() && previous.author.id == expected_author {
                    return Ok(Some(previous));
                }
            }
        }

        let channel = &message.channel;
        let starts_thread = channel.kind == ChannelKind::PublicThread
            && message.reference.is_none()
            && channel.parent_kind == Some(ChannelKind::Text);
        if starts_thread {
            return match channel.parent_id {
                // Thread ids equal the id of the message they were created from.
                Some(parent_channel) => accessor
                    .fetch_message(parent_channel, MessageId(channel.id.0))
                    .await
                    .map(Some),
                None => Ok(None),
            };
        }

        let Some(reference) = &message.reference else {
            return Ok(None);
        };
        if let Some(cached) = &reference.cached {
            return Ok(Some((**cached).clone()));
        }
        let Some(parent_id) = reference.message_id else {
            return Ok(None);
        };
        let channel_id = reference.channel_id.unwrap_or(channel.id);
        accessor.fetch_message(channel_id, parent_id).await.map(Some)
    }

    // ── Rendering ─────────────────────────────────────────────────────────

    fn render_turn(&self, node: &MessageNode) -> Option<Turn> {
        let text = truncate_chars(node.text.as_deref().unwrap_or_default(), self.limits.max_text);
        let images = &node.images[..node.images.len().min(self.image_budget())];

        let mut content = if images.is_empty() {
            TurnContent::Text(text.to_string())
        } else {
            let mut parts = Vec::with_capacity(images.len() + 1);
            if !text.is_empty() {
                parts.push(ContentPart::text(text));
            }
            parts.extend(images.iter().cloned());
            TurnContent::Parts(parts)
        };

        if content.is_empty() {
            return None;
        }

        if self.flags.prefix_display_names && node.role == Role::User {
            let name = node.display_name.as_deref().unwrap_or("unknown");
            prefix_display_name(&mut content, name);
        }

        let name = if self.flags.accept_usernames {
            node.author_id.map(|id| id.to_string())
        } else {
            None
        };

        Some(Turn {
            role: node.role,
            content,
            name,
        })
    }

    fn collect_warnings(&self, node: &MessageNode, turn_count: usize, warnings: &mut UserWarnings) {
        let text_len = node.text.as_deref().map_or(0, |t| t.chars().count());
        if text_len > self.limits.max_text {
            warnings.insert(Warning::MaxText {
                max_text: self.limits.max_text,
            });
        }

        let max_images = self.image_budget();
        if node.images.len() > max_images {
            warnings.insert(if max_images > 0 {
                Warning::MaxImages { max_images }
            } else {
                Warning::CantSeeImages
            });
        }

        if node.has_unsupported_attachments {
            warnings.insert(Warning::UnsupportedAttachments);
        }

        let budget_exhausted = node.parent.is_some() && turn_count == self.limits.max_turns;
        if node.parent_fetch_failed || budget_exhausted {
            warnings.insert(Warning::OnlyUsingLast { count: turn_count });
        }
    }
}

/// The first `max_chars` characters of `text`.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn data_uri(content_type: &str, bytes: &[u8]) -> String {
    format!(
        "data:{content_type};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

fn prefix_display_name(content: &mut TurnContent, name: &str) {
    match content {
        TurnContent::Text(text) => *text = format!("{name}: {text}"),
        TurnContent::Parts(parts) => {
            if let Some(ContentPart::Text { text }) = parts.first_mut() {
                *text = format!("{name}: {text}");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
