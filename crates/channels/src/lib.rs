//! Discord collaborators for replychain.
//!
//! - **DiscordRest**: message history and channel metadata over the REST API
//! - **HttpAttachmentFetcher**: attachment downloads
//! - **DiscordReplySink**: posts, edits and deletes reply messages

pub mod attachments;
pub mod discord;
pub mod sink;

pub use attachments::HttpAttachmentFetcher;
pub use discord::DiscordRest;
pub use sink::DiscordReplySink;
