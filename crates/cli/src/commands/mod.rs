pub mod assemble;
pub mod config_cmd;
pub mod redact;
pub mod reply;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use replychain_agent::{NodeCache, ReplyPipeline};
use replychain_channels::{DiscordRest, HttpAttachmentFetcher};
use replychain_config::AppConfig;
use replychain_core::channel::{Author, ChannelId};
use tracing::{debug, warn};

/// `path`, or the default location.
pub fn config_path(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

/// Load the configuration, applying a `--model` override.
pub fn load_config(path: Option<&Path>, model: Option<String>) -> anyhow::Result<AppConfig> {
    let path = config_path(path);
    let mut config = AppConfig::load_with_overrides(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    if let Some(model) = model {
        config.model = Some(model);
        config.validate().context("Invalid --model")?;
    }
    Ok(config)
}

/// Everything needed to talk to Discord on behalf of the bot.
pub struct Session {
    pub rest: DiscordRest,
    pub fetcher: HttpAttachmentFetcher,
    pub bot: Author,
}

impl Session {
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        let token = config.bot_token.as_deref().context(
            "No bot token configured (set bot_token, REPLYCHAIN_BOT_TOKEN or DISCORD_BOT_TOKEN)",
        )?;
        let rest = DiscordRest::new(token)?;
        let bot = rest
            .current_user()
            .await
            .context("Failed to resolve the bot user")?;
        debug!(bot_id = %bot.id, name = %bot.name, "Connected to Discord");
        Ok(Self {
            rest,
            fetcher: HttpAttachmentFetcher::new()?,
            bot,
        })
    }

    /// A pipeline answering as this bot, with a fresh node cache.
    pub fn pipeline(&self, config: AppConfig) -> anyhow::Result<ReplyPipeline> {
        Ok(ReplyPipeline::from_config(
            config,
            self.bot.id,
            Arc::new(NodeCache::new()),
        )?)
    }

    /// Guild member listing for `{users}`; only fetched when the prompt asks
    /// for it.
    pub async fn users_listing(&self, config: &AppConfig, channel: ChannelId) -> Option<String> {
        if !config.system_prompt.contains("{users}") {
            return None;
        }
        match self.rest.guild_members(channel).await {
            Ok(members) => Some(replychain_agent::users_listing(&members)),
            Err(e) => {
                warn!(error = %e, "Failed to list guild members");
                None
            }
        }
    }
}
