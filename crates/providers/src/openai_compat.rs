//! OpenAI-compatible streaming provider.
//!
//! Works with: OpenAI, OpenRouter, Ollama, LM Studio, vLLM, xAI, Groq and
//! any other endpoint exposing `/chat/completions` with SSE streaming.
//!
//! Request bodies start from the configured extra body (provider defaults
//! overlaid with per-model parameters), then the model, messages and
//! streaming flags are set on top. Usage reporting is always requested.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use replychain_config::ProviderConfig;
use replychain_core::error::ProviderError;
use replychain_core::provider::{ChunkReceiver, Provider, ProviderRequest, StreamChunk, Usage};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, trace, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Provider for OpenAI-compatible chat completion endpoints.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Provider named `name` from its `[providers.<name>]` table.
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self, ProviderError> {
        if config.base_url.is_empty() {
            return Err(ProviderError::NotConfigured(format!(
                "provider '{name}' has no base_url"
            )));
        }
        Self::new(name, &config.base_url, config.api_key_or_default())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// JSON body for a streaming completion.
    fn request_body(request: &ProviderRequest) -> Value {
        let mut body: Map<String, Value> = request.extra_body.clone();

        let mut stream_options = match body.remove("stream_options") {
            Some(Value::Object(existing)) => existing,
            _ => Map::new(),
        };
        stream_options.insert("include_usage".into(), Value::Bool(true));

        body.insert("model".into(), json!(request.model));
        body.insert("messages".into(), json!(request.messages));
        body.insert("stream".into(), Value::Bool(true));
        body.insert("stream_options".into(), Value::Object(stream_options));
        Value::Object(body)
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request);

        debug!(
            provider = %self.name,
            model = %request.model,
            turns = request.messages.len(),
            "Sending streaming request"
        );

        let mut builder = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&body);
        if !request.extra_query.is_empty() {
            builder = builder.query(&request.extra_query);
        }
        for (name, value) in &request.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if !(200..300).contains(&status) {
            let error_body = response.text().await.unwrap_or_default();
            warn!(provider = %self.name, status, body = %error_body, "Provider streaming error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();

        // Read the SSE byte stream and forward parsed chunks until the
        // receiver goes away or the stream ends.
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut lines = SseLineBuffer::default();
            let mut state = StreamAssembler::default();

            while let Some(next) = bytes.next().await {
                let data = match next {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for line in lines.push(&data) {
                    match state.feed_line(&line) {
                        Ok(Feed::Chunks(chunks)) => {
                            for chunk in chunks {
                                if tx.send(Ok(chunk)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(Feed::Done(chunk)) => {
                            let _ = tx.send(Ok(chunk)).await;
                            return;
                        }
                        Err(e) => {
                            trace!(provider = %provider_name, error = %e, "Ignoring unparseable SSE chunk");
                        }
                    }
                }
            }

            // Stream ended without [DONE]
            let _ = tx.send(Ok(state.finish())).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(response.status().is_success())
    }
}

// --- SSE handling ---

/// Splits a byte stream into complete lines. Bytes are buffered until a
/// newline arrives, so multi-byte characters split across reads survive.
#[derive(Debug, Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        lines
    }
}

enum Feed {
    Chunks(Vec<StreamChunk>),
    /// `[DONE]` seen; the final chunk carries finish reason and usage
    Done(StreamChunk),
}

/// Turns SSE lines into stream chunks.
///
/// Content deltas are forwarded as they come. The finish reason and usage
/// are held back and delivered together in one final chunk, since usage
/// arrives after the finish reason.
#[derive(Debug, Default)]
struct StreamAssembler {
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl StreamAssembler {
    fn feed_line(&mut self, line: &str) -> Result<Feed, serde_json::Error> {
        // Blank separators and `:` comments
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(Feed::Chunks(Vec::new()));
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(Feed::Chunks(Vec::new()));
        }
        if data == "[DONE]" {
            return Ok(Feed::Done(self.finish()));
        }

        let event: StreamResponse = serde_json::from_str(data)?;
        if let Some(usage) = event.usage {
            self.usage = Some(usage.into());
        }

        let mut chunks = Vec::new();
        if let Some(choice) = event.choices.into_iter().next() {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                chunks.push(StreamChunk::delta(content));
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
        Ok(Feed::Chunks(chunks))
    }

    fn finish(&mut self) -> StreamChunk {
        StreamChunk {
            content: None,
            finish_reason: Some(self.finish_reason.take().unwrap_or_else(|| "stop".into())),
            usage: self.usage.take(),
        }
    }
}

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(usage: ApiUsage) -> Self {
        Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replychain_core::message::{ContentPart, Turn, TurnContent};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chunks(feed: Feed) -> Vec<StreamChunk> {
        match feed {
            Feed::Chunks(chunks) => chunks,
            Feed::Done(chunk) => vec![chunk],
        }
    }

    #[test]
    fn constructor_trims_trailing_slash() {
        let provider = OpenAiCompatProvider::new("openai", "https://api.openai.com/v1/", "k").unwrap();
        assert_eq!(provider.base_url(), "https://api.openai.com/v1");
        assert_eq!(provider.name(), "openai");
        assert!(!format!("{provider:?}").contains("\"k\""));
    }

    #[test]
    fn from_config_requires_a_base_url() {
        let config = ProviderConfig {
            base_url: String::new(),
            api_key: None,
            extra_headers: Default::default(),
            extra_query: Default::default(),
            extra_body: Default::default(),
        };
        assert!(matches!(
            OpenAiCompatProvider::from_config("local", &config),
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[test]
    fn request_body_merges_extras_and_forces_streaming() {
        let mut extra_body = Map::new();
        extra_body.insert("temperature".into(), json!(0.3));
        extra_body.insert("stream".into(), json!(false));
        extra_body.insert("stream_options".into(), json!({"custom": 1}));
        let request = ProviderRequest {
            model: "gpt-4o".into(),
            messages: vec![
                Turn::system("Be brief."),
                Turn::user(TurnContent::Parts(vec![
                    ContentPart::text("what is this"),
                    ContentPart::image_url("data:image/png;base64,AAAA"),
                ]))
                .with_name("42"),
            ],
            extra_body,
            ..ProviderRequest::default()
        };

        let body = OpenAiCompatProvider::request_body(&request);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["stream_options"], json!({"custom": 1, "include_usage": true}));
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "Be brief."}));
        assert_eq!(
            body["messages"][1],
            json!({
                "role": "user",
                "name": "42",
                "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
                ]
            })
        );
    }

    #[test]
    fn line_buffer_handles_split_lines_and_characters() {
        let mut buffer = SseLineBuffer::default();
        let bytes = "data: é\r\n\ndata: x".as_bytes();
        // Split inside the two-byte é.
        assert!(buffer.push(&bytes[..7]).is_empty());
        assert_eq!(buffer.push(&bytes[7..]), vec!["data: é".to_string(), String::new()]);
        assert_eq!(buffer.push(b"\n"), vec!["data: x".to_string()]);
    }

    #[test]
    fn content_deltas_are_forwarded() {
        let mut state = StreamAssembler::default();
        let out = chunks(
            state
                .feed_line(r#"data: {"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#)
                .unwrap(),
        );
        assert_eq!(out, vec![StreamChunk::delta("Hello")]);
        assert!(chunks(state.feed_line(": keep-alive").unwrap()).is_empty());
        assert!(chunks(state.feed_line("").unwrap()).is_empty());
    }

    #[test]
    fn finish_and_usage_arrive_together_on_done() {
        let mut state = StreamAssembler::default();
        let out = chunks(
            state
                .feed_line(r#"data: {"choices":[{"delta":{},"finish_reason":"length"}]}"#)
                .unwrap(),
        );
        assert!(out.is_empty());
        state
            .feed_line(r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#)
            .unwrap();

        match state.feed_line("data: [DONE]").unwrap() {
            Feed::Done(chunk) => {
                assert_eq!(chunk.finish_reason.as_deref(), Some("length"));
                assert_eq!(
                    chunk.usage,
                    Some(Usage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                        total_tokens: 15
                    })
                );
            }
            Feed::Chunks(_) => panic!("expected done"),
        }
    }

    #[test]
    fn malformed_data_is_an_error() {
        let mut state = StreamAssembler::default();
        assert!(state.feed_line("data: {not json").is_err());
    }

    async fn chat_server(response: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(response)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn streams_sse_from_a_server() {
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(header("x-title", "replychain"))
            .and(query_param("api-version", "2024-10-21"))
            .and(body_partial_json(json!({
                "model": "m",
                "stream": true,
                "stream_options": {"include_usage": true}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;
        let provider =
            OpenAiCompatProvider::new("test", format!("{}/v1", server.uri()), "sk-test").unwrap();

        let mut rx = provider
            .stream(ProviderRequest {
                model: "m".into(),
                messages: vec![Turn::user("hi")],
                extra_headers: [("x-title".to_string(), "replychain".to_string())].into(),
                extra_query: [("api-version".to_string(), "2024-10-21".to_string())].into(),
                ..ProviderRequest::default()
            })
            .await
            .unwrap();

        let mut text = String::new();
        let mut finish = None;
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk.unwrap();
            if let Some(content) = &chunk.content {
                text.push_str(content);
            }
            if chunk.is_finish() {
                finish = chunk.finish_reason.clone();
            }
        }
        assert_eq!(text, "Hello");
        assert_eq!(finish.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn maps_error_statuses() {
        let server = chat_server(ResponseTemplate::new(429).insert_header("retry-after", "12")).await;
        let provider =
            OpenAiCompatProvider::new("test", format!("{}/v1", server.uri()), "sk-test").unwrap();
        let err = provider.stream(ProviderRequest::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { retry_after_secs: 12 }));

        let server = chat_server(ResponseTemplate::new(401)).await;
        let provider =
            OpenAiCompatProvider::new("test", format!("{}/v1", server.uri()), "sk-bad").unwrap();
        let err = provider.stream(ProviderRequest::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));

        let server =
            chat_server(ResponseTemplate::new(404).set_body_string("model not found")).await;
        let provider =
            OpenAiCompatProvider::new("test", format!("{}/v1", server.uri()), "sk-test").unwrap();
        let err = provider.stream(ProviderRequest::default()).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::ApiError { status_code: 404, ref message } if message == "model not found"
        ));
    }
}
