//! Attachment downloads over plain HTTP(S).

use std::time::Duration;

use async_trait::async_trait;
use replychain_core::channel::{Attachment, AttachmentFetcher, FetchedAttachment};
use replychain_core::error::ChannelError;
use tracing::debug;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Downloads attachment URLs with a shared HTTP client.
#[derive(Debug, Clone)]
pub struct HttpAttachmentFetcher {
    client: reqwest::Client,
}

impl HttpAttachmentFetcher {
    pub fn new() -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| ChannelError::NotConfigured(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AttachmentFetcher for HttpAttachmentFetcher {
    async fn fetch(&self, attachment: &Attachment) -> Result<FetchedAttachment, ChannelError> {
        let response = self
            .client
            .get(&attachment.url)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(format!("{}: {e}", attachment.url)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ChannelError::NotFound(attachment.url.clone()));
        }
        if !status.is_success() {
            return Err(ChannelError::Transport(format!(
                "{}: HTTP {status}",
                attachment.url
            )));
        }

        // The declared type wins; the response header is the fallback.
        let content_type = attachment
            .content_type
            .clone()
            .or_else(|| {
                response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            })
            .unwrap_or_else(|| "application/octet-stream".into());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ChannelError::Transport(format!("{}: {e}", attachment.url)))?;
        debug!(url = %attachment.url, bytes = bytes.len(), "Attachment downloaded");

        Ok(FetchedAttachment {
            content_type,
            bytes: bytes.to_vec(),
        })
    }
}
