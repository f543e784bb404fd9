//! Discord REST client.
//!
//! Reads message history for the context assembler ([`MessageAccessor`]) and
//! performs the writes the reply sink needs. Only the REST API is used; the
//! gateway connection is out of scope.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use replychain_core::channel::{
    Attachment, Author, ChannelId, ChannelInfo, ChannelKind, ChatMessage, Embed, MessageAccessor,
    MessageId, MessageKind, MessageReference, UserId,
};
use replychain_core::error::ChannelError;
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace, warn};

pub const API_BASE: &str = "https://discord.com/api/v10";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MEMBER_PAGE_LIMIT: u32 = 1000;

/// Discord REST client.
pub struct DiscordRest {
    client: reqwest::Client,
    base_url: String,
    token: String,
    channels: Mutex<HashMap<ChannelId, CachedChannel>>,
}

#[derive(Debug, Clone)]
struct CachedChannel {
    info: ChannelInfo,
    guild_id: Option<u64>,
}

impl std::fmt::Debug for DiscordRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordRest")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl DiscordRest {
    pub fn new(token: impl Into<String>) -> Result<Self, ChannelError> {
        Self::with_base_url(token, API_BASE)
    }

    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ChannelError> {
        let token = token.into();
        if token.is_empty() {
            return Err(ChannelError::NotConfigured("Discord bot token is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("replychain/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ChannelError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// The bot's own account.
    pub async fn current_user(&self) -> Result<Author, ChannelError> {
        let user: RawUser = self.get("/users/@me", &[]).await?;
        user.into_author(None)
    }

    /// Channel metadata, fetched once per channel.
    ///
    /// Threads carry their parent's id and kind; guild channels carry their
    /// category.
    pub async fn channel_info(&self, id: ChannelId) -> Result<ChannelInfo, ChannelError> {
        Ok(self.cached_channel(id).await?.info)
    }

    async fn cached_channel(&self, id: ChannelId) -> Result<CachedChannel, ChannelError> {
        if let Some(hit) = self.lock_channels().get(&id).cloned() {
            return Ok(hit);
        }

        let raw: RawChannel = self.get(&format!("/channels/{id}"), &[]).await?;
        let kind = channel_kind(raw.kind);
        let parent_id = optional_snowflake(raw.parent_id.as_deref())?;

        let mut info = ChannelInfo::new(id, kind);
        if kind.is_thread() {
            if let Some(parent) = parent_id {
                let parent_raw: RawChannel =
                    self.get(&format!("/channels/{parent}"), &[]).await?;
                info.parent_id = Some(ChannelId(parent));
                info.parent_kind = Some(channel_kind(parent_raw.kind));
                info.category_id =
                    optional_snowflake(parent_raw.parent_id.as_deref())?.map(ChannelId);
            }
        } else {
            info.category_id = parent_id.map(ChannelId);
        }

        let cached = CachedChannel {
            info,
            guild_id: optional_snowflake(raw.guild_id.as_deref())?,
        };
        debug!(channel_id = %id, kind = ?cached.info.kind, "Cached channel info");
        self.lock_channels().insert(id, cached.clone());
        Ok(cached)
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelId, CachedChannel>> {
        self.channels.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fetch a message the bot should answer, with the author's guild
    /// nickname and roles filled in.
    pub async fn fetch_trigger(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<ChatMessage, ChannelError> {
        let mut message = self.fetch_message(channel_id, message_id).await?;
        let channel = self.cached_channel(channel_id).await?;
        if let Some(guild_id) = channel.guild_id {
            let path = format!("/guilds/{guild_id}/members/{}", message.author.id);
            match self.get::<RawMember>(&path, &[]).await {
                Ok(member) => {
                    if member.nick.is_some() {
                        message.author.display_name = member.nick.clone();
                    }
                    message.author.role_ids = parse_roles(&member.roles)?;
                }
                Err(e) if e.is_not_found() => {
                    debug!(user_id = %message.author.id, "Author is no longer a guild member");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(message)
    }

    /// Members of the guild `channel_id` belongs to (empty for DMs).
    pub async fn guild_members(&self, channel_id: ChannelId) -> Result<Vec<Author>, ChannelError> {
        let Some(guild_id) = self.cached_channel(channel_id).await?.guild_id else {
            return Ok(Vec::new());
        };
        let members: Vec<RawMember> = self
            .get(
                &format!("/guilds/{guild_id}/members"),
                &[("limit", MEMBER_PAGE_LIMIT.to_string())],
            )
            .await?;
        members
            .into_iter()
            .filter_map(|m| {
                let nick = m.nick;
                m.user.map(|user| user.into_author(nick))
            })
            .collect()
    }

    pub async fn trigger_typing(&self, channel_id: ChannelId) -> Result<(), ChannelError> {
        self.send(Method::POST, &format!("/channels/{channel_id}/typing"), None)
            .await
            .map(|_| ())
    }

    pub(crate) async fn create_message(
        &self,
        channel_id: ChannelId,
        body: &Value,
    ) -> Result<MessageId, ChannelError> {
        let created = self
            .send(Method::POST, &format!("/channels/{channel_id}/messages"), Some(body))
            .await?;
        let id = created
            .as_ref()
            .and_then(|v| v.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::InvalidPayload("created message has no id".into()))?;
        Ok(MessageId(snowflake(id)?))
    }

    pub(crate) async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        body: &Value,
    ) -> Result<(), ChannelError> {
        self.send(
            Method::PATCH,
            &format!("/channels/{channel_id}/messages/{message_id}"),
            Some(body),
        )
        .await
        .map(|_| ())
    }

    pub(crate) async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), ChannelError> {
        self.send(
            Method::DELETE,
            &format!("/channels/{channel_id}/messages/{message_id}"),
            None,
        )
        .await
        .map(|_| ())
    }

    /// Convert a raw message, resolving channel metadata for it and for the
    /// referenced message.
    async fn hydrate(&self, raw: RawMessage) -> Result<ChatMessage, ChannelError> {
        let channel = self.channel_info(ChannelId(snowflake(&raw.channel_id)?)).await?;
        let reference_channel_id = optional_snowflake(
            raw.message_reference
                .as_ref()
                .and_then(|r| r.channel_id.as_deref()),
        )?
        .map(ChannelId);
        let reference_channel = match reference_channel_id {
            Some(id) if id != channel.id => Some(self.channel_info(id).await?),
            _ => None,
        };
        convert_message(raw, &channel, reference_channel.as_ref())
    }

    // --- HTTP ---

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ChannelError> {
        let url = format!("{}{path}", self.base_url);
        trace!(%url, "Discord GET");
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .query(query)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        let response = check_status(path, response).await?;
        response
            .json()
            .await
            .map_err(|e| ChannelError::InvalidPayload(format!("{path}: {e}")))
    }

    /// Write request; returns the response body when there is one.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, ChannelError> {
        let url = format!("{}{path}", self.base_url);
        trace!(%method, %url, "Discord write");
        let mut request = self
            .client
            .request(method, &url)
            .header("Authorization", format!("Bot {}", self.token));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        let response = check_status(path, response).await?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ChannelError::InvalidPayload(format!("{path}: {e}")))
    }
}

async fn check_status(
    path: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ChannelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ChannelError::NotFound(path.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    warn!(path, status = status.as_u16(), body = %body, "Discord API error");
    Err(ChannelError::Transport(format!("{path}: HTTP {status}: {body}")))
}

#[async_trait]
impl MessageAccessor for DiscordRest {
    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<ChatMessage, ChannelError> {
        let raw: RawMessage = self
            .get(&format!("/channels/{channel_id}/messages/{message_id}"), &[])
            .await?;
        self.hydrate(raw).await
    }

    async fn fetch_previous(
        &self,
        message: &ChatMessage,
    ) -> Result<Option<ChatMessage>, ChannelError> {
        let mut page: Vec<RawMessage> = self
            .get(
                &format!("/channels/{}/messages", message.channel.id),
                &[("before", message.id.to_string()), ("limit", "1".into())],
            )
            .await?;
        match page.pop() {
            Some(raw) => self.hydrate(raw).await.map(Some),
            None => Ok(None),
        }
    }
}

// --- Discord JSON ---

#[derive(Debug, Deserialize)]
struct RawChannel {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    id: String,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    bot: bool,
}

impl RawUser {
    fn into_author(self, nick: Option<String>) -> Result<Author, ChannelError> {
        Ok(Author {
            id: UserId(snowflake(&self.id)?),
            name: self.username,
            display_name: nick.or(self.global_name),
            bot: self.bot,
            role_ids: Vec::new(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawMember {
    #[serde(default)]
    user: Option<RawUser>,
    #[serde(default)]
    nick: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawAttachment {
    url: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEmbedFooter {
    text: String,
}

#[derive(Debug, Deserialize)]
struct RawEmbed {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    footer: Option<RawEmbedFooter>,
}

#[derive(Debug, Deserialize)]
struct RawReference {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: String,
    channel_id: String,
    author: RawUser,
    #[serde(default)]
    member: Option<RawMember>,
    #[serde(default)]
    content: String,
    #[serde(rename = "type", default)]
    kind: u8,
    #[serde(default)]
    attachments: Vec<RawAttachment>,
    #[serde(default)]
    embeds: Vec<RawEmbed>,
    #[serde(default)]
    mentions: Vec<RawUser>,
    #[serde(default)]
    message_reference: Option<RawReference>,
    #[serde(default)]
    referenced_message: Option<Box<RawMessage>>,
}

fn snowflake(raw: &str) -> Result<u64, ChannelError> {
    raw.parse()
        .map_err(|_| ChannelError::InvalidPayload(format!("invalid snowflake '{raw}'")))
}

fn optional_snowflake(raw: Option<&str>) -> Result<Option<u64>, ChannelError> {
    raw.map(snowflake).transpose()
}

fn parse_roles(roles: &[String]) -> Result<Vec<u64>, ChannelError> {
    roles.iter().map(|r| snowflake(r)).collect()
}

fn channel_kind(kind: u8) -> ChannelKind {
    match kind {
        0 | 5 => ChannelKind::Text,
        1 | 3 => ChannelKind::Private,
        10 | 11 => ChannelKind::PublicThread,
        12 => ChannelKind::PrivateThread,
        _ => ChannelKind::Other,
    }
}

fn message_kind(kind: u8) -> MessageKind {
    match kind {
        0 => MessageKind::Default,
        19 => MessageKind::Reply,
        _ => MessageKind::System,
    }
}

/// Convert Discord JSON into a [`ChatMessage`].
///
/// A delivered `referenced_message` becomes the reference's cached copy,
/// living in `reference_channel` (or `channel` when that is `None`).
fn convert_message(
    raw: RawMessage,
    channel: &ChannelInfo,
    reference_channel: Option<&ChannelInfo>,
) -> Result<ChatMessage, ChannelError> {
    let (nick, role_ids) = match raw.member {
        Some(member) => (member.nick, parse_roles(&member.roles)?),
        None => (None, Vec::new()),
    };
    let mut author = raw.author.into_author(nick)?;
    author.role_ids = role_ids;

    let reference = match raw.message_reference {
        Some(reference) => {
            let cached = match raw.referenced_message {
                Some(mut parent) => {
                    // Only one level is ever delivered.
                    parent.referenced_message = None;
                    let parent_channel = reference_channel.unwrap_or(channel);
                    Some(Box::new(convert_message(*parent, parent_channel, None)?))
                }
                None => None,
            };
            Some(MessageReference {
                message_id: optional_snowflake(reference.message_id.as_deref())?.map(MessageId),
                channel_id: optional_snowflake(reference.channel_id.as_deref())?.map(ChannelId),
                cached,
            })
        }
        None => None,
    };

    Ok(ChatMessage {
        id: MessageId(snowflake(&raw.id)?),
        channel: channel.clone(),
        author,
        content: raw.content,
        kind: message_kind(raw.kind),
        attachments: raw
            .attachments
            .into_iter()
            .map(|a| Attachment {
                url: a.url,
                content_type: a.content_type,
                filename: a.filename,
            })
            .collect(),
        embeds: raw
            .embeds
            .into_iter()
            .map(|e| Embed {
                title: e.title,
                description: e.description,
                footer: e.footer.map(|f| f.text),
            })
            .collect(),
        reference,
        mentions: raw
            .mentions
            .iter()
            .map(|u| snowflake(&u.id).map(UserId))
            .collect::<Result<_, _>>()?,
    })
}
