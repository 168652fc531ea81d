//! OpenAI-compatible chat-completions client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::types::{GenerateRequest, Generation, Message, OutputMode};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Anything that can turn a prompt into text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Model id reported in result metadata.
    fn model(&self) -> &str;

    async fn generate(&self, request: &GenerateRequest) -> Result<Generation, LlmError>;
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Maximum allowed response body (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed prompt characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

/// Wait applied to a 429 without a usable `Retry-After` header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Settings for [`OpenAiClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4-turbo-preview".into(),
            temperature: 0.1,
            timeout: Duration::from_secs(120),
            max_retries: 0,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Chat-completions client for OpenAI and compatible APIs.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl OpenAiClient {
    /// Create a client with an API key and settings.
    pub fn with_config(api_key: impl Into<String>, config: ClientConfig) -> Result<Self, LlmError> {
        let api_key = api_key.into();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| LlmError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| LlmError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    /// Delay before retry number `attempt` (zero-based).
    fn backoff(&self, attempt: u32, err: &LlmError) -> Duration {
        let exponential = self.config.retry_base_delay.saturating_mul(1 << attempt.min(6));
        match err {
            LlmError::RateLimited { retry_after } => exponential.max(*retry_after),
            _ => exponential,
        }
    }

    async fn send_once(&self, request: &GenerateRequest) -> Result<Generation, LlmError> {
        let start = Instant::now();
        let body = build_request(&self.config, request);

        let mut response = self.client.post(self.chat_url()).json(&body).send().await?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(LlmError::Malformed(format!(
                    "response too large: {new_len} bytes"
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&bytes);

        if !status.is_success() {
            let message = serde_json::from_str::<ChatApiResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

            return Err(match status.as_u16() {
                429 => LlmError::RateLimited {
                    retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
                },
                400 | 404 | 413 | 422 => LlmError::InvalidRequest(message),
                code => LlmError::provider(Some(code), message, code >= 500 || code == 408),
            });
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::Malformed(format!("invalid JSON: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(LlmError::provider(
                Some(status.as_u16()),
                error.message.unwrap_or_default(),
                false,
            ));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| LlmError::Malformed("no choices in response".into()))?;

        let (content, tool_arguments) = match choice.message {
            Some(message) => (
                message.content.unwrap_or_default(),
                message
                    .tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|tc| tc.function.and_then(|f| f.arguments))
                    .collect(),
            ),
            None => (String::new(), Vec::new()),
        };

        let usage = parsed.usage.unwrap_or_default();

        Ok(Generation {
            content,
            tool_arguments,
            input_tokens: usage.prompt_tokens.unwrap_or(0),
            output_tokens: usage.completion_tokens.unwrap_or(0),
            latency: start.elapsed(),
            finish_reason: choice.finish_reason,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAiClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Generation, LlmError> {
        let total_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
        if total_chars > MAX_INPUT_CHARS {
            return Err(LlmError::InvalidRequest(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let mut attempt = 0;
        loop {
            match self.send_once(request).await {
                Ok(generation) => {
                    debug!(
                        model = %self.config.model,
                        input_tokens = generation.input_tokens,
                        output_tokens = generation.output_tokens,
                        latency_ms = generation.latency.as_millis() as u64,
                        tool_calls = generation.tool_arguments.len(),
                        "generation complete"
                    );
                    return Ok(generation);
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.backoff(attempt, &err);
                    warn!(
                        code = err.code(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying generation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

fn build_request<'a>(config: &'a ClientConfig, request: &'a GenerateRequest) -> ChatApiRequest<'a> {
    let (tools, tool_choice) = match (&request.schema, request.mode) {
        (Some(schema), OutputMode::ForcedTool | OutputMode::OptionalTool) => {
            let tool = json!({
                "type": "function",
                "function": {
                    "name": schema.name,
                    "description": schema.description,
                    "parameters": schema.parameters,
                }
            });
            let choice = if request.mode == OutputMode::ForcedTool {
                json!({ "type": "function", "function": { "name": schema.name } })
            } else {
                json!("auto")
            };
            (Some(vec![tool]), Some(choice))
        }
        _ => (None, None),
    };

    ChatApiRequest {
        model: &config.model,
        messages: &request.messages,
        temperature: config.temperature,
        tools,
        tool_choice,
    }
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: Option<ToolFunction>,
}

#[derive(Deserialize)]
struct ToolFunction {
    arguments: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    use super::*;
    use crate::types::SchemaHint;

    fn client_for(server: &MockServer, max_retries: u32) -> OpenAiClient {
        OpenAiClient::with_config(
            "sk-test",
            ClientConfig {
                base_url: server.uri(),
                model: "gpt-test".into(),
                timeout: Duration::from_secs(5),
                max_retries,
                retry_base_delay: Duration::from_millis(0),
                ..ClientConfig::default()
            },
        )
        .unwrap()
    }

    fn chunk_schema() -> SchemaHint {
        SchemaHint {
            name: "create_chunks".into(),
            description: "Record chunks".into(),
            parameters: json!({"type": "object", "properties": {"chunks": {"type": "array"}}}),
        }
    }

    #[tokio::test]
    async fn parses_content_and_usage() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": { "content": "[{\"content\": \"hi\"}]" },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, 0);
        let generation = client
            .generate(&GenerateRequest::text("system", "user"))
            .await
            .unwrap();

        assert_eq!(generation.content, "[{\"content\": \"hi\"}]");
        assert!(!generation.has_tool_calls());
        assert_eq!(generation.input_tokens, 10);
        assert_eq!(generation.output_tokens, 20);
        assert_eq!(generation.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn forced_tool_request_names_the_function() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({
                "model": "gpt-test",
                "tool_choice": { "type": "function", "function": { "name": "create_chunks" } }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [
                            {"function": {"name": "create_chunks", "arguments": "{\"chunks\": []}"}},
                            {"function": {"name": "create_chunks", "arguments": "{\"chunks\": [1]}"}}
                        ]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, 0);
        let request = GenerateRequest::text("system", "user")
            .with_schema(chunk_schema(), OutputMode::ForcedTool);
        let generation = client.generate(&request).await.unwrap();

        assert!(generation.content.is_empty());
        assert_eq!(generation.tool_arguments.len(), 2);
        assert_eq!(generation.tool_arguments[1], "{\"chunks\": [1]}");
    }

    #[test]
    fn optional_tool_uses_auto_choice() {
        let config = ClientConfig::default();
        let request = GenerateRequest::text("s", "u").with_schema(chunk_schema(), OutputMode::OptionalTool);
        let body = serde_json::to_value(build_request(&config, &request)).unwrap();
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["function"]["name"], "create_chunks");
        assert_eq!(body["messages"][0]["role"], "system");

        let plain = GenerateRequest::text("s", "u");
        let body = serde_json::to_value(build_request(&config, &plain)).unwrap();
        assert!(body.get("tools").is_none());
    }

    #[tokio::test]
    async fn classifies_http_429_as_rate_limit() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "7")
                    .set_body_json(json!({ "error": { "message": "slow down" } })),
            )
            .mount(&server)
            .await;

        let err = client_for(&server, 0)
            .generate(&GenerateRequest::text("s", "u"))
            .await
            .unwrap_err();
        match err {
            LlmError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(7));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({ "error": { "message": "unknown model" } })),
            )
            .mount(&server)
            .await;

        let err = client_for(&server, 3)
            .generate(&GenerateRequest::text("s", "u"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(ref m) if m == "unknown model"));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[derive(Clone)]
    struct FlipResponder {
        calls: Arc<AtomicUsize>,
        first: ResponseTemplate,
        second: ResponseTemplate,
    }

    impl Respond for FlipResponder {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                self.first.clone()
            } else {
                self.second.clone()
            }
        }
    }

    #[tokio::test]
    async fn retries_server_errors_when_enabled() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(FlipResponder {
                calls: Arc::new(AtomicUsize::new(0)),
                first: ResponseTemplate::new(500)
                    .set_body_json(json!({ "error": { "message": "transient" } })),
                second: ResponseTemplate::new(200).set_body_json(json!({
                    "choices": [{ "message": { "content": "ok" }, "finish_reason": "stop" }],
                    "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
                })),
            })
            .mount(&server)
            .await;

        let generation = client_for(&server, 1)
            .generate(&GenerateRequest::text("s", "u"))
            .await
            .unwrap();
        assert_eq!(generation.content, "ok");
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn server_error_surfaces_without_retries() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server, 0)
            .generate(&GenerateRequest::text("s", "u"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn rejects_oversized_prompt_locally() {
        let server = MockServer::start().await;
        let huge = "x".repeat(MAX_INPUT_CHARS + 1);
        let err = client_for(&server, 0)
            .generate(&GenerateRequest::text("s", huge))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
