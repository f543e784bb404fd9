//! Per-message node cache shared by every concurrent assembly.
//!
//! Each platform message gets at most one [`MessageNode`], guarded by its own
//! async lock. Whoever holds the lock first populates the node; everyone
//! else waits and then reads the populated result, so the expensive work
//! (attachment downloads, parent lookups) happens at most once per message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};

use replychain_core::channel::{ChatMessage, MessageId, UserId};
use replychain_core::message::{ContentPart, Role};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Cached view of one message.
///
/// `text` doubles as the populated marker: a node is populated once it is
/// `Some`, and nothing but [`MessageNode::text`] is read before that.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageNode {
    /// Cleaned body, embed summaries and text attachments joined by newlines
    pub text: Option<String>,

    /// Image parts as `data:` URIs, in attachment order
    pub images: Vec<ContentPart>,

    pub role: Role,

    /// Author of a user turn
    pub author_id: Option<UserId>,

    /// Author display name captured at population time
    pub display_name: Option<String>,

    pub has_unsupported_attachments: bool,

    /// The message this one continues, resolved once at population time
    pub parent: Option<ChatMessage>,

    /// Parent resolution hit an error; the chain ends here
    pub parent_fetch_failed: bool,
}

impl Default for MessageNode {
    fn default() -> Self {
        Self {
            text: None,
            images: Vec::new(),
            role: Role::Assistant,
            author_id: None,
            display_name: None,
            has_unsupported_attachments: false,
            parent: None,
            parent_fetch_failed: false,
        }
    }
}

impl MessageNode {
    pub fn is_populated(&self) -> bool {
        self.text.is_some()
    }
}

/// Shared handle to one node's lock.
pub type NodeHandle = Arc<Mutex<MessageNode>>;

/// Map from message id to node. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: StdMutex<HashMap<MessageId, NodeHandle>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The node for `id`, created empty if absent.
    pub fn get_or_create(&self, id: MessageId) -> NodeHandle {
        self.map().entry(id).or_default().clone()
    }

    pub fn get(&self, id: MessageId) -> Option<NodeHandle> {
        self.map().get(&id).cloned()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.map().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    /// Install a fresh, already-locked node for a reply message the bot is
    /// about to write.
    ///
    /// Readers that reach the reply before it is finished block on the lock
    /// and then see the final text. Any existing node for `id` is replaced.
    pub async fn claim(&self, id: MessageId, parent: ChatMessage) -> OwnedMutexGuard<MessageNode> {
        let handle: NodeHandle = Arc::new(Mutex::new(MessageNode {
            parent: Some(parent),
            ..MessageNode::default()
        }));
        // Nobody else can see the handle yet, so this resolves immediately.
        let guard = handle.clone().lock_owned().await;
        self.map().insert(id, handle);
        guard
    }

    /// Remove `id` once no one is using it.
    ///
    /// Waits for the node's lock, so a populate in flight finishes first.
    /// Returns false if the node was absent or got replaced meanwhile.
    pub async fn evict(&self, id: MessageId) -> bool {
        let Some(handle) = self.get(id) else {
            return false;
        };
        let _guard = handle.lock().await;
        let mut nodes = self.map();
        match nodes.get(&id) {
            Some(current) if Arc::ptr_eq(current, &handle) => {
                nodes.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Evict the oldest nodes (smallest ids) until at most `max_nodes` remain.
    /// Returns how many were removed.
    pub async fn prune(&self, max_nodes: usize) -> usize {
        let excess: Vec<MessageId> = {
            let nodes = self.map();
            if nodes.len() <= max_nodes {
                return 0;
            }
            let mut ids: Vec<MessageId> = nodes.keys().copied().collect();
            ids.sort_unstable();
            ids.truncate(nodes.len() - max_nodes);
            ids
        };

        let mut removed = 0;
        for id in excess {
            if self.evict(id).await {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, remaining = self.len(), "Pruned message node cache");
        }
        removed
    }

    fn map(&self) -> StdMutexGuard<'_, HashMap<MessageId, NodeHandle>> {
        // The map holds no invariants a panicking holder could break.
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
