//! Chat platform model and collaborator traits.
//!
//! [`ChatMessage`] is a platform-neutral snapshot of one message, shaped after
//! what Discord exposes: author, channel context, attachments, embeds and an
//! optional reply reference. The context assembler never talks to the
//! platform directly; it goes through [`MessageAccessor`] and
//! [`AttachmentFetcher`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Platform message identifier. Ordered by creation time (snowflakes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

/// Platform channel (or thread) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

/// Platform user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

macro_rules! display_id {
    ($($ty:ty),*) => {
        $(impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_id!(MessageId, ChannelId, UserId);

impl UserId {
    /// The canonical mention token, e.g. `<@1234>`.
    pub fn mention(&self) -> String {
        format!("<@{}>", self.0)
    }

    /// The legacy nickname mention token, e.g. `<@!1234>`.
    pub fn nick_mention(&self) -> String {
        format!("<@!{}>", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Ordinary guild text channel
    Text,
    /// Direct message with the bot
    Private,
    PublicThread,
    PrivateThread,
    Other,
}

impl ChannelKind {
    pub fn is_thread(&self) -> bool {
        matches!(self, Self::PublicThread | Self::PrivateThread)
    }
}

/// Where a message lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub kind: ChannelKind,

    /// For threads: the channel the thread was created in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ChannelId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_kind: Option<ChannelKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<ChannelId>,
}

impl ChannelInfo {
    pub fn new(id: ChannelId, kind: ChannelKind) -> Self {
        Self {
            id,
            kind,
            parent_id: None,
            parent_kind: None,
            category_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,

    /// Unique account name
    pub name: String,

    /// Server nickname or global display name, when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default)]
    pub bot: bool,

    /// Guild role ids of the author (empty in DMs)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub role_ids: Vec<u64>,
}

impl Author {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Default,
    Reply,
    /// Joins, pins, thread notices and every other system message
    System,
}

impl MessageKind {
    /// Ordinary user-authored content (not a system notice).
    pub fn is_ordinary(&self) -> bool {
        matches!(self, Self::Default | Self::Reply)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,

    /// Declared MIME type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl Attachment {
    pub fn is_text(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("text/"))
    }

    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"))
    }

    /// Text and image attachments are the only ones the assembler reads.
    pub fn is_supported(&self) -> bool {
        self.is_text() || self.is_image()
    }
}

/// Rich embed summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
}

impl Embed {
    /// Title, description and footer joined by newlines, empty parts dropped.
    pub fn summary(&self) -> String {
        [&self.title, &self.description, &self.footer]
            .into_iter()
            .filter_map(|part| part.as_deref())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// An explicit reply reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,

    /// Channel of the referenced message; defaults to the referencing channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,

    /// Copy of the referenced message delivered alongside the reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<Box<ChatMessage>>,
}

/// A snapshot of one chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub channel: ChannelInfo,
    pub author: Author,

    #[serde(default)]
    pub content: String,

    pub kind: MessageKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<MessageReference>,

    /// Users mentioned in the message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<UserId>,
}

impl ChatMessage {
    /// Whether the body mentions `user`.
    pub fn mentions_user(&self, user: UserId) -> bool {
        self.mentions.contains(&user)
            || self.content.contains(&user.mention())
            || self.content.contains(&user.nick_mention())
    }

    /// The body with one leading mention of `user` removed, then left-trimmed.
    pub fn content_without_mention(&self, user: UserId) -> &str {
        let content = self.content.as_str();
        content
            .strip_prefix(user.mention().as_str())
            .or_else(|| content.strip_prefix(user.nick_mention().as_str()))
            .map(str::trim_start)
            .unwrap_or(content)
    }

    pub fn is_private(&self) -> bool {
        self.channel.kind == ChannelKind::Private
    }
}

/// Downloaded attachment body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAttachment {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Read access to platform message history.
#[async_trait]
pub trait MessageAccessor: Send + Sync {
    /// Fetch one message by id.
    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> std::result::Result<ChatMessage, ChannelError>;

    /// The message immediately preceding `message` in its channel, if any.
    async fn fetch_previous(
        &self,
        message: &ChatMessage,
    ) -> std::result::Result<Option<ChatMessage>, ChannelError>;
}

/// Downloads attachment content.
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(
        &self,
        attachment: &Attachment,
    ) -> std::result::Result<FetchedAttachment, ChannelError>;
}
