//! Error types for the replychain domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use crate::channel::MessageId;
use thiserror::Error;

/// The top-level error type for all replychain operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Channel errors ---
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    // --- Context assembly errors ---
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Failures talking to the chat platform.
///
/// `NotFound` and `Transport` are the two outcomes the context assembler
/// distinguishes; everything the REST layer can hit maps onto one of them.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("Message delivery failed to {channel}: {reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl ChannelError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[derive(Debug, Clone, Error)]
pub enum ContextError {
    /// An attachment of `message_id` could not be downloaded; the node stays
    /// unpopulated so a later walk retries it.
    #[error("Attachment fetch failed for message {message_id}: {source}")]
    Attachment {
        message_id: MessageId,
        #[source]
        source: ChannelError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn context_error_names_the_message() {
        let err = Error::Context(ContextError::Attachment {
            message_id: MessageId(42),
            source: ChannelError::Transport("connection reset".into()),
        });
        let text = err.to_string();
        assert!(text.contains("42"));
        assert!(text.contains("connection reset"));
    }

    #[test]
    fn not_found_is_distinguished() {
        assert!(ChannelError::NotFound("msg".into()).is_not_found());
        assert!(!ChannelError::Transport("dns".into()).is_not_found());
    }
}
