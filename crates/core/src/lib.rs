//! # replychain core
//!
//! Domain types, traits, and error definitions shared by every replychain
//! crate. Nothing in here talks to the network: the chat platform and the
//! completion service are described as traits and implemented elsewhere.
//!
//! ## Layout
//!
//! - [`message`]: role-tagged turns and their content parts
//! - [`channel`]: the chat message model plus the accessor/fetcher traits
//! - [`provider`]: completion requests and the streaming provider trait
//! - [`error`]: one error enum per bounded context

pub mod channel;
pub mod error;
pub mod message;
pub mod provider;

// Re-export key types at crate root for ergonomics
pub use channel::{
    AttachmentFetcher, ChannelId, ChatMessage, FetchedAttachment, MessageAccessor, MessageId,
    UserId,
};
pub use error::{ChannelError, ContextError, Error, ProviderError, Result};
pub use message::{ContentPart, Role, Turn, TurnContent};
pub use provider::{ChunkReceiver, Provider, ProviderRequest, StreamChunk, Usage};
