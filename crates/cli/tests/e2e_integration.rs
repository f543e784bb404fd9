//! End-to-end integration tests for replychain.
//!
//! These tests run the whole reply pipeline in memory: gate, context
//! assembly over a reply chain, prompt building, a scripted streaming
//! provider and a recording sink standing in for Discord.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use replychain_agent::{
    NodeCache, PipelineOutcome, ReplyFrame, ReplyOutcome, ReplyPipeline, ReplyServices,
    ReplySink, SkipReason,
};
use replychain_config::{AppConfig, ProviderConfig};
use replychain_core::channel::{
    Attachment, AttachmentFetcher, Author, ChannelId, ChannelInfo, ChannelKind, ChatMessage,
    FetchedAttachment, MessageAccessor, MessageId, MessageKind, MessageReference, UserId,
};
use replychain_core::error::{ChannelError, ProviderError};
use replychain_core::message::{Role, TurnContent};
use replychain_core::provider::{ChunkReceiver, Provider, ProviderRequest, StreamChunk, Usage};

const BOT: UserId = UserId(1000);
const ALICE: UserId = UserId(1);
const CHANNEL: ChannelId = ChannelId(500);

// ── Chat fixtures ────────────────────────────────────────────────────────

fn author(id: UserId) -> Author {
    Author {
        id,
        name: if id == BOT { "bot".into() } else { format!("user{}", id.0) },
        display_name: None,
        bot: id == BOT,
        role_ids: vec![],
    }
}

fn message(id: u64, from: UserId, content: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId(id),
        channel: ChannelInfo::new(CHANNEL, ChannelKind::Text),
        author: author(from),
        content: content.into(),
        kind: MessageKind::Default,
        attachments: vec![],
        embeds: vec![],
        reference: None,
        mentions: vec![],
    }
}

fn reply(id: u64, from: UserId, content: &str, parent: u64) -> ChatMessage {
    ChatMessage {
        kind: MessageKind::Reply,
        reference: Some(MessageReference {
            message_id: Some(MessageId(parent)),
            channel_id: Some(CHANNEL),
            cached: None,
        }),
        ..message(id, from, content)
    }
}

// ── Mock Discord ─────────────────────────────────────────────────────────

#[derive(Default)]
struct History {
    messages: Mutex<HashMap<MessageId, ChatMessage>>,
    fetches: Mutex<usize>,
}

impl History {
    fn insert(&self, message: ChatMessage) {
        self.messages.lock().unwrap().insert(message.id, message);
    }

    fn fetches(&self) -> usize {
        *self.fetches.lock().unwrap()
    }
}

#[async_trait]
impl MessageAccessor for History {
    async fn fetch_message(
        &self,
        _channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<ChatMessage, ChannelError> {
        *self.fetches.lock().unwrap() += 1;
        self.messages
            .lock()
            .unwrap()
            .get(&message_id)
            .cloned()
            .ok_or_else(|| ChannelError::NotFound(message_id.to_string()))
    }

    async fn fetch_previous(
        &self,
        message: &ChatMessage,
    ) -> Result<Option<ChatMessage>, ChannelError> {
        let messages = self.messages.lock().unwrap();
        Ok(messages
            .values()
            .filter(|m| m.channel.id == message.channel.id && m.id < message.id)
            .max_by_key(|m| m.id)
            .cloned())
    }
}

struct Cdn;

#[async_trait]
impl AttachmentFetcher for Cdn {
    async fn fetch(&self, attachment: &Attachment) -> Result<FetchedAttachment, ChannelError> {
        Ok(FetchedAttachment {
            content_type: attachment.content_type.clone().unwrap_or_default(),
            bytes: b"attachment body".to_vec(),
        })
    }
}

/// Records what the pipeline asks Discord to do.
#[derive(Default)]
struct RecordingSink {
    next_id: u64,
    warnings: Vec<String>,
    frames: Vec<ReplyFrame>,
    aborted: Option<String>,
    failed: Option<String>,
}

impl RecordingSink {
    fn new(first_id: u64) -> Self {
        Self {
            next_id: first_id,
            ..Self::default()
        }
    }

    fn last_frame(&self) -> &ReplyFrame {
        self.frames.last().expect("no frame rendered")
    }

    fn posted(&self) -> usize {
        self.frames.iter().map(|f| f.pages.len()).max().unwrap_or(0)
    }
}

#[async_trait]
impl ReplySink for RecordingSink {
    async fn post_warnings(
        &mut self,
        warnings: &[String],
    ) -> Result<Option<MessageId>, ChannelError> {
        self.warnings = warnings.to_vec();
        let id = MessageId(self.next_id);
        self.next_id += 1;
        Ok(Some(id))
    }

    async fn render(&mut self, frame: &ReplyFrame) -> Result<Vec<MessageId>, ChannelError> {
        let already = self.posted();
        self.frames.push(frame.clone());
        let mut created = Vec::new();
        for _ in already..frame.pages.len() {
            created.push(MessageId(self.next_id));
            self.next_id += 1;
        }
        Ok(created)
    }

    async fn abort(&mut self, reason: &str) -> Result<(), ChannelError> {
        self.aborted = Some(reason.to_string());
        Ok(())
    }

    async fn fail(&mut self, error: &str) -> Result<(), ChannelError> {
        self.failed = Some(error.to_string());
        Ok(())
    }
}

// ── Mock Provider ────────────────────────────────────────────────────────

/// Streams a fixed script of chunks and keeps every request it was sent.
struct ScriptedProvider {
    script: Vec<Result<StreamChunk, ProviderError>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    fn new(script: Vec<Result<StreamChunk, ProviderError>>) -> Self {
        Self {
            script,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Deltas followed by a finish chunk with usage.
    fn deltas(deltas: &[&str]) -> Self {
        let mut script: Vec<_> = deltas.iter().map(|d| Ok(StreamChunk::delta(*d))).collect();
        script.push(Ok(StreamChunk {
            content: None,
            finish_reason: Some("stop".into()),
            usage: Some(Usage {
                prompt_tokens: 20,
                completion_tokens: 8,
                total_tokens: 28,
            }),
        }));
        Self::new(script)
    }

    fn last_request(&self) -> ProviderRequest {
        self.requests
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("provider was never called")
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        for chunk in self.script.clone() {
            tx.send(chunk).await.unwrap();
        }
        Ok(rx)
    }
}

// ── Config ───────────────────────────────────────────────────────────────

fn config(model: &str) -> AppConfig {
    let mut config = AppConfig {
        model: Some(model.into()),
        system_prompt: "You are a concise assistant.".into(),
        ..AppConfig::default()
    };
    let provider = model.split('/').next().unwrap();
    config.providers.insert(
        provider.into(),
        ProviderConfig {
            base_url: "http://localhost:8080/v1".into(),
            api_key: None,
            extra_headers: Default::default(),
            extra_query: Default::default(),
            extra_body: Default::default(),
        },
    );
    config
}

fn pipeline(config: AppConfig) -> ReplyPipeline {
    ReplyPipeline::from_config(config, BOT, Arc::new(NodeCache::new())).unwrap()
}

// ── E2E: Conversation ────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_reply_chain_reaches_the_model_and_back() {
    let history = History::default();
    let first = message(10, ALICE, "<@1000> what is the capital of France?");
    history.insert(first.clone());

    let pipeline = pipeline(config("openai/gpt-4o"));
    let provider = ScriptedProvider::deltas(&["<think>easy", " one</think>", "Paris", "."]);
    let services = ReplyServices {
        accessor: &history,
        fetcher: &Cdn,
        provider: &provider,
        users_listing: None,
    };
    let mut sink = RecordingSink::new(2000);

    let outcome = pipeline.handle(&first, &services, &mut sink).await.unwrap();
    let PipelineOutcome::Replied(ReplyOutcome::Completed {
        text,
        message_ids,
        saw_reasoning,
        usage,
    }) = outcome
    else {
        panic!("expected a completed reply, got {outcome:?}");
    };
    assert_eq!(text, "Paris.");
    assert!(saw_reasoning);
    assert_eq!(message_ids, vec![MessageId(2000)]);
    assert_eq!(usage.map(|u| u.total_tokens), Some(28));

    // The request: system turn, then the user's message with the mention stripped.
    let request = provider.last_request();
    assert_eq!(request.model, "gpt-4o");
    assert_eq!(request.messages.len(), 2);
    assert_eq!(request.messages[0].role, Role::System);
    assert!(
        request.messages[0]
            .content
            .text()
            .unwrap()
            .starts_with("You are a concise assistant.")
    );
    assert_eq!(
        request.messages[1].content,
        TurnContent::Text("what is the capital of France?".into())
    );
    assert_eq!(request.messages[1].name.as_deref(), Some("1"));

    // What Discord saw: a finished embed without reasoning.
    let frame = sink.last_frame();
    assert!(frame.complete);
    assert!(frame.pages[0].text.ends_with("Paris."));
    assert!(frame.pages[0].text.starts_with("💡 Done thinking!"));
    assert!(!frame.pages[0].text.contains("easy"));
    assert!(frame.pages[0].footer.as_deref().unwrap().starts_with("openai/gpt-4o • "));

    // Follow-up reply to the bot: the bot's turn comes from the cache.
    history.insert(message(2000, BOT, ""));
    let follow_up = reply(11, ALICE, "<@1000> and of Italy?", 2000);
    history.insert(follow_up.clone());

    let provider = ScriptedProvider::deltas(&["Rome."]);
    let services = ReplyServices {
        provider: &provider,
        ..services
    };
    let mut sink = RecordingSink::new(3000);
    pipeline.handle(&follow_up, &services, &mut sink).await.unwrap();

    let request = provider.last_request();
    let roles: Vec<Role> = request.messages.iter().map(|t| t.role).collect();
    assert_eq!(
        roles,
        vec![Role::System, Role::User, Role::Assistant, Role::User]
    );
    assert_eq!(request.messages[2].content, TurnContent::Text("Paris.".into()));
    assert_eq!(
        request.messages[3].content,
        TurnContent::Text("and of Italy?".into())
    );
}

#[tokio::test]
async fn e2e_plain_replies_are_paginated_at_the_end() {
    let history = History::default();
    let trigger = message(10, ALICE, "<@1000> write a lot");
    history.insert(trigger.clone());

    let pipeline = pipeline(AppConfig {
        use_plain_responses: true,
        ..config("openai/gpt-4o")
    });
    let long = "x".repeat(4500);
    let provider = ScriptedProvider::deltas(&[&long[..3000], &long[3000..]]);
    let services = ReplyServices {
        accessor: &history,
        fetcher: &Cdn,
        provider: &provider,
        users_listing: None,
    };
    let mut sink = RecordingSink::new(2000);

    let outcome = pipeline.handle(&trigger, &services, &mut sink).await.unwrap();
    assert!(matches!(
        outcome,
        PipelineOutcome::Replied(ReplyOutcome::Completed { ref message_ids, .. })
            if message_ids.len() == 3
    ));

    assert_eq!(sink.frames.len(), 1, "plain replies are posted once");
    let sizes: Vec<usize> = sink.last_frame().pages.iter().map(|p| p.text.len()).collect();
    assert_eq!(sizes, vec![2000, 2000, 500]);
    assert!(sink.last_frame().pages.iter().all(|p| p.footer.is_none()));
}

#[tokio::test]
async fn e2e_warnings_precede_the_reply() {
    let history = History::default();
    let mut trigger = message(10, ALICE, "<@1000> what is in this picture?");
    trigger.attachments.push(Attachment {
        url: "https://cdn.example/cat.png".into(),
        content_type: Some("image/png".into()),
        filename: Some("cat.png".into()),
    });
    trigger.attachments.push(Attachment {
        url: "https://cdn.example/doc.pdf".into(),
        content_type: Some("application/pdf".into()),
        filename: Some("doc.pdf".into()),
    });
    history.insert(trigger.clone());

    // A model without vision.
    let pipeline = pipeline(config("local/qwen3"));
    let provider = ScriptedProvider::deltas(&["I can't see it."]);
    let services = ReplyServices {
        accessor: &history,
        fetcher: &Cdn,
        provider: &provider,
        users_listing: None,
    };
    let mut sink = RecordingSink::new(2000);

    let outcome = pipeline.handle(&trigger, &services, &mut sink).await.unwrap();
    assert_eq!(
        sink.warnings,
        vec!["⚠️ Can't see images", "⚠️ Unsupported attachments"]
    );
    let PipelineOutcome::Replied(ReplyOutcome::Completed { message_ids, .. }) = outcome else {
        panic!("expected a completed reply");
    };
    assert_eq!(message_ids, vec![MessageId(2000), MessageId(2001)]);

    // No name field and no image parts for this model.
    let request = provider.last_request();
    assert!(request.messages.iter().all(|t| t.name.is_none()));
    assert_eq!(request.messages.last().unwrap().content.image_count(), 0);
}

// ── E2E: Gate ────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_unaddressed_and_denied_messages_are_skipped() {
    let history = History::default();
    let provider = ScriptedProvider::deltas(&["never sent"]);
    let services = ReplyServices {
        accessor: &history,
        fetcher: &Cdn,
        provider: &provider,
        users_listing: None,
    };

    let open = pipeline(config("openai/gpt-4o"));
    let mut sink = RecordingSink::new(2000);
    let outcome = open
        .handle(&message(10, ALICE, "talking to myself"), &services, &mut sink)
        .await
        .unwrap();
    assert_eq!(outcome, PipelineOutcome::Skipped(SkipReason::NotMentioned));

    let mut strict = config("openai/gpt-4o");
    strict.permissions.users.blocked_ids = vec![ALICE.0];
    let outcome = pipeline(strict)
        .handle(&message(11, ALICE, "<@1000> hello?"), &services, &mut sink)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        PipelineOutcome::Skipped(SkipReason::Denied(_))
    ));

    assert!(provider.requests.lock().unwrap().is_empty());
    assert!(sink.frames.is_empty());
    assert_eq!(history.fetches(), 0);
}

// ── E2E: Failure paths ───────────────────────────────────────────────────

#[tokio::test]
async fn e2e_blocked_reply_is_withdrawn() {
    let history = History::default();
    let trigger = message(10, ALICE, "<@1000> say something bad");
    history.insert(trigger.clone());

    let pipeline = pipeline(AppConfig {
        block_response_regex: Some("(?i)forbidden".into()),
        ..config("openai/gpt-4o")
    });
    let provider = ScriptedProvider::deltas(&["Sure, here is some ", "FORBIDDEN text"]);
    let services = ReplyServices {
        accessor: &history,
        fetcher: &Cdn,
        provider: &provider,
        users_listing: None,
    };
    let mut sink = RecordingSink::new(2000);

    let outcome = pipeline.handle(&trigger, &services, &mut sink).await.unwrap();
    assert!(matches!(
        outcome,
        PipelineOutcome::Replied(ReplyOutcome::Blocked { .. })
    ));
    assert_eq!(
        sink.aborted.as_deref(),
        Some("Response blocked by server policy.")
    );
    for frame in &sink.frames {
        assert!(frame.pages.iter().all(|p| !p.text.contains("FORBIDDEN")));
    }
    assert!(!pipeline.cache().contains(MessageId(2000)));
}

#[tokio::test]
async fn e2e_stream_error_is_reported() {
    let history = History::default();
    let trigger = message(10, ALICE, "<@1000> hi");
    history.insert(trigger.clone());

    let pipeline = pipeline(config("openai/gpt-4o"));
    let provider = ScriptedProvider::new(vec![
        Ok(StreamChunk::delta("Hello, I was about to")),
        Err(ProviderError::StreamInterrupted("connection reset".into())),
    ]);
    let services = ReplyServices {
        accessor: &history,
        fetcher: &Cdn,
        provider: &provider,
        users_listing: None,
    };
    let mut sink = RecordingSink::new(2000);

    let err = pipeline
        .handle(&trigger, &services, &mut sink)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("connection reset"));

    let failure = sink.failed.expect("failure was not reported");
    assert!(failure.starts_with("Error during streaming"));
    assert!(failure.contains("connection reset"));

    // The placeholder stays unpopulated, so a later walk re-reads it.
    let node = pipeline.cache().get(MessageId(2000)).unwrap();
    assert!(node.lock().await.text.is_none());
}
