//! Completion providers for replychain.
//!
//! Every configured backend speaks the OpenAI chat-completions protocol, so
//! a single client covers them all; the `[providers.<name>]` table decides
//! where requests go.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use replychain_config::{AppConfig, ModelSelection};
use replychain_core::error::ProviderError;

/// The client for the provider named by `selection`.
pub fn build_provider(
    config: &AppConfig,
    selection: &ModelSelection,
) -> Result<OpenAiCompatProvider, ProviderError> {
    let provider = config
        .provider(selection)
        .map_err(|e| ProviderError::NotConfigured(e.to_string()))?;
    OpenAiCompatProvider::from_config(&selection.provider, provider)
}
