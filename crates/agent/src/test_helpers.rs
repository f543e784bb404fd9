//! Shared test helpers: in-memory history and attachment store.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use replychain_core::channel::{
    Attachment, AttachmentFetcher, Author, ChannelId, ChannelInfo, ChannelKind, ChatMessage,
    FetchedAttachment, MessageAccessor, MessageId, MessageKind, MessageReference, UserId,
};
use replychain_core::error::ChannelError;

pub const BOT: UserId = UserId(1000);
pub const ALICE: UserId = UserId(1);
pub const BOB: UserId = UserId(2);
pub const CHANNEL: ChannelId = ChannelId(500);

pub fn author(id: UserId, name: &str) -> Author {
    Author {
        id,
        name: name.to_lowercase(),
        display_name: Some(name.to_string()),
        bot: id == BOT,
        role_ids: vec![],
    }
}

/// A plain message from `from` in the shared text channel.
pub fn message(id: u64, from: UserId, content: &str) -> ChatMessage {
    let name = match from {
        BOT => "Bot",
        ALICE => "Alice",
        BOB => "Bob",
        _ => "Someone",
    };
    ChatMessage {
        id: MessageId(id),
        channel: ChannelInfo::new(CHANNEL, ChannelKind::Text),
        author: author(from, name),
        content: content.to_string(),
        kind: MessageKind::Default,
        attachments: vec![],
        embeds: vec![],
        reference: None,
        mentions: vec![],
    }
}

/// `message` with an explicit reply reference to `parent` (not cached).
pub fn reply(id: u64, from: UserId, content: &str, parent: u64) -> ChatMessage {
    let mut msg = message(id, from, content);
    msg.kind = MessageKind::Reply;
    msg.reference = Some(MessageReference {
        message_id: Some(MessageId(parent)),
        channel_id: Some(CHANNEL),
        cached: None,
    });
    msg
}

pub fn attachment(url: &str, content_type: &str) -> Attachment {
    Attachment {
        url: url.to_string(),
        content_type: Some(content_type.to_string()),
        filename: None,
    }
}

/// Message history keyed by id. Unknown ids are `NotFound`.
#[derive(Default)]
pub struct InMemoryHistory {
    messages: Mutex<HashMap<MessageId, ChatMessage>>,
    broken: Mutex<HashSet<MessageId>>,
    fetches: AtomicUsize,
}

impl InMemoryHistory {
    pub fn new(messages: impl IntoIterator<Item = ChatMessage>) -> Self {
        let history = Self::default();
        for msg in messages {
            history.insert(msg);
        }
        history
    }

    pub fn insert(&self, msg: ChatMessage) {
        self.messages.lock().unwrap().insert(msg.id, msg);
    }

    /// Make lookups of `id` fail with a transport error.
    pub fn break_message(&self, id: u64) {
        self.broken.lock().unwrap().insert(MessageId(id));
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn lookup(&self, id: MessageId) -> Result<ChatMessage, ChannelError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.broken.lock().unwrap().contains(&id) {
            return Err(ChannelError::Transport(format!("connection reset fetching {id}")));
        }
        self.messages
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| ChannelError::NotFound(format!("message {id}")))
    }
}

#[async_trait]
impl MessageAccessor for InMemoryHistory {
    async fn fetch_message(
        &self,
        _channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<ChatMessage, ChannelError> {
        tokio::task::yield_now().await;
        self.lookup(message_id)
    }

    async fn fetch_previous(
        &self,
        message: &ChatMessage,
    ) -> Result<Option<ChatMessage>, ChannelError> {
        tokio::task::yield_now().await;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let messages = self.messages.lock().unwrap();
        Ok(messages
            .values()
            .filter(|m| m.channel.id == message.channel.id && m.id < message.id)
            .max_by_key(|m| m.id)
            .cloned())
    }
}

/// Attachment bodies keyed by URL; counts every download.
#[derive(Default)]
pub struct CountingFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    downloads: AtomicUsize,
}

impl CountingFetcher {
    pub fn with(self, url: &str, body: &[u8]) -> Self {
        self.bodies.lock().unwrap().insert(url.to_string(), body.to_vec());
        self
    }

    pub fn fail(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn heal(&self, url: &str) {
        self.failing.lock().unwrap().remove(url);
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttachmentFetcher for CountingFetcher {
    async fn fetch(&self, attachment: &Attachment) -> Result<FetchedAttachment, ChannelError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        // Give a concurrent walker the chance to race us.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        if self.failing.lock().unwrap().contains(&attachment.url) {
            return Err(ChannelError::Transport(format!("download of {} failed", attachment.url)));
        }
        let bytes = self
            .bodies
            .lock()
            .unwrap()
            .get(&attachment.url)
            .cloned()
            .unwrap_or_default();
        Ok(FetchedAttachment {
            content_type: attachment.content_type.clone().unwrap_or_default(),
            bytes,
        })
    }
}
