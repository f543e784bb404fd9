//! `replychain assemble`: show what a reply would be built from, without
//! calling the model or posting anything.

use anyhow::Context;
use replychain_config::AppConfig;
use replychain_core::channel::{ChannelId, MessageId};

use super::Session;

pub async fn run(
    config: AppConfig,
    channel: u64,
    message: u64,
    full_request: bool,
) -> anyhow::Result<()> {
    let session = Session::connect(&config).await?;
    let trigger = session
        .rest
        .fetch_trigger(ChannelId(channel), MessageId(message))
        .await
        .with_context(|| format!("Failed to fetch message {message} in channel {channel}"))?;
    let users_listing = session.users_listing(&config, trigger.channel.id).await;
    let pipeline = session.pipeline(config)?;

    if let Err(reason) = pipeline.gate(&trigger) {
        eprintln!("Note: a live reply would be skipped ({reason:?})");
    }

    let context = pipeline
        .assemble(&trigger, &session.rest, &session.fetcher)
        .await?;

    let output = if full_request {
        serde_json::to_value(pipeline.completion_request(&context, users_listing.as_deref())?)?
    } else {
        serde_json::json!({
            "model": pipeline.selection().raw,
            "turns": context.chronological(),
            "warnings": context.warnings.messages(),
        })
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
