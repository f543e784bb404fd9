//! `replychain reply`: answer one message end to end.

use anyhow::Context;
use replychain_agent::{PipelineOutcome, ReplyOutcome, ReplyServices};
use replychain_channels::DiscordReplySink;
use replychain_config::AppConfig;
use replychain_core::channel::{ChannelId, MessageId};
use replychain_providers::build_provider;
use tracing::{info, warn};

use super::Session;

pub async fn run(config: AppConfig, channel: u64, message: u64) -> anyhow::Result<()> {
    let session = Session::connect(&config).await?;
    let selection = config.selected_model()?;
    let provider = build_provider(&config, &selection)?;

    let trigger = session
        .rest
        .fetch_trigger(ChannelId(channel), MessageId(message))
        .await
        .with_context(|| format!("Failed to fetch message {message} in channel {channel}"))?;
    let users_listing = session.users_listing(&config, trigger.channel.id).await;
    let pipeline = session.pipeline(config)?;

    if pipeline.gate(&trigger).is_ok() {
        if let Err(e) = session.rest.trigger_typing(trigger.channel.id).await {
            warn!(error = %e, "Failed to show typing indicator");
        }
    }

    let services = ReplyServices {
        accessor: &session.rest,
        fetcher: &session.fetcher,
        provider: &provider,
        users_listing: users_listing.as_deref(),
    };
    let mut sink = DiscordReplySink::new(&session.rest, &trigger);

    match pipeline.handle(&trigger, &services, &mut sink).await? {
        PipelineOutcome::Skipped(reason) => {
            println!("Not replying: {reason:?}");
        }
        PipelineOutcome::Replied(ReplyOutcome::Completed {
            text,
            message_ids,
            saw_reasoning,
            usage,
        }) => {
            info!(
                messages = message_ids.len(),
                chars = text.chars().count(),
                saw_reasoning,
                "Reply posted"
            );
            let ids: Vec<String> = message_ids.iter().map(ToString::to_string).collect();
            println!("Replied with message(s) {}", ids.join(", "));
            if let Some(usage) = usage {
                println!(
                    "Tokens: {} prompt + {} completion = {}",
                    usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
                );
            }
        }
        PipelineOutcome::Replied(ReplyOutcome::Blocked { reason }) => {
            println!("Reply blocked: {reason}");
        }
    }

    Ok(())
}
