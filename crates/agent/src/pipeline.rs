//! The reply pipeline: one triggering message in, one streamed reply out.
//!
//! 1. **Gate**: ignore bots, and guild messages that don't mention the bot
//! 2. **Authorize** against the configured permissions
//! 3. **Assemble** the conversation from the reply chain
//! 4. **Request** a streamed completion (system prompt first)
//! 5. **Stream** the reply into the sink
//!
//! Configuration and the selected model are passed in explicitly; nothing
//! here reads process-wide state.

use std::sync::Arc;

use replychain_config::{AppConfig, ModelCapabilities, ModelSelection};
use replychain_core::channel::{AttachmentFetcher, ChatMessage, MessageAccessor, UserId};
use replychain_core::error::{ContextError, Error};
use replychain_core::provider::{Provider, ProviderRequest};
use replychain_security::{AccessDecision, AccessPolicy, AccessRequest, ResponsePolicy};
use tracing::{debug, info, warn};

use crate::context::{
    AssembledContext, AssemblyInput, ContextAssembler, ContextFlags, ContextLimits, NodeCache,
};
use crate::prompt::{build_completion_request, format_system_prompt};
use crate::reply::ReplyStyle;
use crate::responder::{ReplyOutcome, ReplySettings, ReplySink, ResponseStreamer};

/// Why a message got no reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Written by a bot (including this one)
    FromBot,
    /// A guild message that doesn't mention the bot
    NotMentioned,
    /// Refused by the access policy
    Denied(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Skipped(SkipReason),
    Replied(ReplyOutcome),
}

/// Platform and model collaborators for one reply.
pub struct ReplyServices<'a> {
    pub accessor: &'a dyn MessageAccessor,
    pub fetcher: &'a dyn AttachmentFetcher,
    pub provider: &'a dyn Provider,
    /// Guild member listing for the `{users}` prompt placeholder
    pub users_listing: Option<&'a str>,
}

pub struct ReplyPipeline {
    config: AppConfig,
    selection: ModelSelection,
    capabilities: ModelCapabilities,
    bot_id: UserId,
    cache: Arc<NodeCache>,
    policy: ResponsePolicy,
}

impl ReplyPipeline {
    pub fn new(
        config: AppConfig,
        selection: ModelSelection,
        bot_id: UserId,
        cache: Arc<NodeCache>,
    ) -> Self {
        let capabilities = selection.capabilities();
        let policy = ResponsePolicy::from_config(&config);
        Self {
            config,
            selection,
            capabilities,
            bot_id,
            cache,
            policy,
        }
    }

    /// Build a pipeline for the configured model.
    pub fn from_config(
        config: AppConfig,
        bot_id: UserId,
        cache: Arc<NodeCache>,
    ) -> replychain_core::Result<Self> {
        let selection = config.selected_model().map_err(config_error)?;
        Ok(Self::new(config, selection, bot_id, cache))
    }

    pub fn selection(&self) -> &ModelSelection {
        &self.selection
    }

    pub fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    /// Whether `message` should be answered at all.
    pub fn gate(&self, message: &ChatMessage) -> Result<(), SkipReason> {
        if message.author.bot || message.author.id == self.bot_id {
            return Err(SkipReason::FromBot);
        }
        if !message.is_private() && !message.mentions_user(self.bot_id) {
            return Err(SkipReason::NotMentioned);
        }

        let request = AccessRequest::from_message(message);
        match AccessPolicy::check(&self.config.permissions, self.config.allow_dms, &request) {
            AccessDecision::Allowed => Ok(()),
            AccessDecision::Denied { reason, .. } => Err(SkipReason::Denied(reason)),
        }
    }

    pub fn assembler(&self) -> ContextAssembler {
        ContextAssembler::new(
            self.bot_id,
            ContextLimits {
                max_turns: self.config.max_messages,
                max_text: self.config.max_text,
                max_images: self.config.effective_max_images(self.capabilities),
            },
            ContextFlags {
                accept_images: self.capabilities.accept_images,
                accept_usernames: self.capabilities.accept_usernames,
                prefix_display_names: self.config.experimental_message_formatting,
            },
        )
    }

    pub async fn assemble(
        &self,
        message: &ChatMessage,
        accessor: &dyn MessageAccessor,
        fetcher: &dyn AttachmentFetcher,
    ) -> Result<AssembledContext, ContextError> {
        self.assembler()
            .assemble(&AssemblyInput {
                message,
                cache: &self.cache,
                accessor,
                fetcher,
            })
            .await
    }

    /// The completion request for an assembled conversation.
    pub fn completion_request(
        &self,
        context: &AssembledContext,
        users_listing: Option<&str>,
    ) -> replychain_core::Result<ProviderRequest> {
        let provider = self.config.provider(&self.selection).map_err(config_error)?;
        let system_prompt = format_system_prompt(
            &self.config.system_prompt,
            &chrono::Local::now(),
            self.capabilities.accept_usernames,
            users_listing,
        );

        let mut request = build_completion_request(
            &self.selection.model,
            context,
            system_prompt,
            self.config.request_body(&self.selection),
        );
        request.extra_headers = provider.extra_headers.clone();
        request.extra_query = provider.extra_query.clone();
        Ok(request)
    }

    fn reply_settings(&self) -> ReplySettings {
        ReplySettings {
            max_message_nodes: self.config.max_message_nodes,
            ..ReplySettings::new(
                ReplyStyle::from_plain_flag(self.config.use_plain_responses),
                self.selection.raw.clone(),
            )
        }
    }

    /// Run the whole pipeline for one message.
    pub async fn handle(
        &self,
        message: &ChatMessage,
        services: &ReplyServices<'_>,
        sink: &mut dyn ReplySink,
    ) -> replychain_core::Result<PipelineOutcome> {
        if let Err(reason) = self.gate(message) {
            debug!(message_id = %message.id, ?reason, "Not replying");
            return Ok(PipelineOutcome::Skipped(reason));
        }

        let context = self
            .assemble(message, services.accessor, services.fetcher)
            .await?;
        info!(
            message_id = %message.id,
            user_id = %message.author.id,
            attachments = message.attachments.len(),
            turns = context.len(),
            model = %self.selection,
            "Message received"
        );

        let request = self.completion_request(&context, services.users_listing)?;
        let chunks = match services.provider.stream(request).await {
            Ok(chunks) => chunks,
            Err(e) => {
                if let Err(report) = sink.fail(&format!("Error during streaming: {e}")).await {
                    warn!(error = %report, "Failed to report provider error");
                }
                return Err(e.into());
            }
        };

        let streamer = ResponseStreamer::new(&self.cache, &self.policy, self.reply_settings());
        let outcome = streamer
            .run(message, &context.warnings, chunks, sink)
            .await?;
        Ok(PipelineOutcome::Replied(outcome))
    }
}

fn config_error(e: replychain_config::ConfigError) -> Error {
    Error::Config {
        message: e.to_string(),
    }
}
