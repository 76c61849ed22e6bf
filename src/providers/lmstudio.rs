//! LM Studio and other OpenAI-compatible local servers.
//!
//! Talks to `POST /v1/chat/completions`. The same adapter serves llama.cpp,
//! vLLM and generic OpenAI-compatible servers. Health probes follow the server
//! software, detected from the host URL unless set with
//! [`LMStudioProviderBuilder::backend_kind`].
//!
//! # Environment Variables
//! - `LMSTUDIO_HOST`: server URL (default: http://localhost:1234)
//! - `LMSTUDIO_MODEL`: default chat model
//! - `LMSTUDIO_API_KEY`: optional bearer token

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{LlmError, Result};
use crate::finish_reason;
use crate::health::{BackendKind, HealthMonitor, HealthStatus};
use crate::metrics::{instrument_stream, InferenceTimer, MetricsTracker};
use crate::models;
use crate::providers::http::{self, DEFAULT_LOCAL_TIMEOUT, QUICK_TIMEOUT};
use crate::streaming::EventNormalizer;
use crate::traits::{EventStream, LLMProvider};
use crate::types::{
    AuthMode, ChatMessage, ChatRequest, ChatResponse, ChatRole, ContentBlock, FinishReason,
    Framing, Model, ProviderCapabilities, ToolCall,
};
use crate::usage;

/// Default LM Studio server URL
const DEFAULT_LMSTUDIO_HOST: &str = "http://localhost:1234";

/// Default chat model
const DEFAULT_LMSTUDIO_MODEL: &str = "qwen2.5-7b-instruct";

// ============================================================================
// Chat completions wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessageRequest>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDefinitionRequest>,
}

/// Asks the server for a final usage chunk on streamed completions.
#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct ToolDefinitionRequest {
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionDefinitionRequest,
}

#[derive(Debug, Serialize)]
struct FunctionDefinitionRequest {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ChatMessageRequest {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ToolCallWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ChatMessageRequest {
    fn new(role: &'static str, content: String) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ToolCallWire {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: FunctionCallWire,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FunctionCallWire {
    name: String,
    /// JSON-encoded arguments object.
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<UsageWire>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallWire>,
}

#[derive(Debug, Default, Deserialize)]
struct UsageWire {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

// ============================================================================
// Provider
// ============================================================================

/// LM Studio / OpenAI-compatible local provider.
#[derive(Debug, Clone)]
pub struct LMStudioProvider {
    client: Client,
    host: String,
    model: String,
    api_key: Option<String>,
    framing: Framing,
    timeout: Duration,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsTracker>,
}

/// Builder for LMStudioProvider
#[derive(Debug, Clone)]
pub struct LMStudioProviderBuilder {
    host: String,
    model: String,
    api_key: Option<String>,
    framing: Framing,
    backend_kind: Option<BackendKind>,
    timeout: Duration,
    metrics_capacity: usize,
}

impl Default for LMStudioProviderBuilder {
    fn default() -> Self {
        Self {
            host: DEFAULT_LMSTUDIO_HOST.to_string(),
            model: DEFAULT_LMSTUDIO_MODEL.to_string(),
            api_key: None,
            framing: Framing::Sse,
            backend_kind: None,
            timeout: DEFAULT_LOCAL_TIMEOUT,
            metrics_capacity: crate::metrics::DEFAULT_METRICS_CAPACITY,
        }
    }
}

impl LMStudioProviderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server URL, with or without a trailing `/v1`.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        let trimmed = host.trim_end_matches('/');
        self.host = trimmed.strip_suffix("/v1").unwrap_or(trimmed).to_string();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Bearer token, for servers started with authentication.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Streaming framing: SSE chat chunks (default) or raw chunked text.
    pub fn framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Server software, which selects the health probe endpoints.
    /// Detected from the host URL when not set.
    pub fn backend_kind(mut self, kind: BackendKind) -> Self {
        self.backend_kind = Some(kind);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn metrics_capacity(mut self, capacity: usize) -> Self {
        self.metrics_capacity = capacity;
        self
    }

    /// Build the LMStudioProvider
    pub fn build(self) -> Result<LMStudioProvider> {
        if self.framing == Framing::Ndjson {
            return Err(LlmError::ConfigError(
                "chat completions servers stream SSE or chunked text, not NDJSON".to_string(),
            ));
        }

        let client = Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| LlmError::ConfigError(format!("failed to build HTTP client: {}", e)))?;
        let health = HealthMonitor::new(client.clone(), self.host.clone(), self.backend_kind);

        Ok(LMStudioProvider {
            client,
            host: self.host,
            model: self.model,
            api_key: self.api_key,
            framing: self.framing,
            timeout: self.timeout,
            health: Arc::new(health),
            metrics: Arc::new(MetricsTracker::new(self.metrics_capacity)),
        })
    }
}

impl LMStudioProvider {
    /// Create from `LMSTUDIO_HOST`, `LMSTUDIO_MODEL` and `LMSTUDIO_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let host =
            std::env::var("LMSTUDIO_HOST").unwrap_or_else(|_| DEFAULT_LMSTUDIO_HOST.to_string());
        let model =
            std::env::var("LMSTUDIO_MODEL").unwrap_or_else(|_| DEFAULT_LMSTUDIO_MODEL.to_string());

        let mut builder = LMStudioProviderBuilder::new().host(host).model(model);
        if let Ok(key) = std::env::var("LMSTUDIO_API_KEY") {
            if !key.is_empty() {
                builder = builder.api_key(key);
            }
        }
        builder.build()
    }

    pub fn builder() -> LMStudioProviderBuilder {
        LMStudioProviderBuilder::new()
    }

    /// Create with default settings (localhost:1234)
    pub fn default_local() -> Result<Self> {
        LMStudioProviderBuilder::new().build()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn health_monitor(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    pub fn metrics(&self) -> Arc<MetricsTracker> {
        Arc::clone(&self.metrics)
    }

    /// Start periodic health probes until `cancel` fires.
    pub fn spawn_health_checks(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        Arc::clone(&self.health).spawn_periodic(every, cancel)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Convert messages to chat-completions form.
    ///
    /// Many local chat templates reject a `system` role, so the system prompt
    /// (and any system messages) is prefixed onto the first user turn.
    fn convert_messages(system_prompt: Option<&str>, messages: &[ChatMessage]) -> Vec<ChatMessageRequest> {
        let mut system: Vec<String> = system_prompt.map(str::to_string).into_iter().collect();
        let mut out: Vec<ChatMessageRequest> = Vec::with_capacity(messages.len());

        for msg in messages {
            let mut text = String::new();
            let mut tool_calls = Vec::new();
            let mut results = Vec::new();
            for block in msg.content.blocks() {
                match block {
                    ContentBlock::Text { text: t } => text.push_str(&t),
                    ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCallWire {
                        id,
                        kind: function_kind(),
                        function: FunctionCallWire {
                            name,
                            arguments: Value::Object(input).to_string(),
                        },
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => results.push((tool_use_id, content)),
                }
            }

            match msg.role {
                ChatRole::System => system.push(text),
                ChatRole::User => out.push(ChatMessageRequest::new("user", text)),
                ChatRole::Assistant => out.push(ChatMessageRequest {
                    tool_calls,
                    ..ChatMessageRequest::new("assistant", text)
                }),
                ChatRole::Tool => {
                    if results.is_empty() {
                        results.push((msg.tool_call_id.clone().unwrap_or_default(), text));
                    }
                    for (id, content) in results {
                        out.push(ChatMessageRequest {
                            tool_call_id: Some(id),
                            ..ChatMessageRequest::new("tool", content)
                        });
                    }
                }
            }
        }

        system.retain(|s| !s.is_empty());
        if !system.is_empty() {
            let prefix = system.join("\n\n");
            match out.iter_mut().find(|m| m.role == "user") {
                Some(first_user) => {
                    first_user.content = format!("{}\n\n{}", prefix, first_user.content)
                }
                None => out.insert(0, ChatMessageRequest::new("user", prefix)),
            }
        }
        out
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: request.model_or(&self.model).to_string(),
            messages: Self::convert_messages(request.system_prompt.as_deref(), &request.messages),
            stream,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools: request
                .tools
                .iter()
                .map(|t| ToolDefinitionRequest {
                    kind: "function",
                    function: FunctionDefinitionRequest {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        }
    }

    fn parse_response(&self, response: ChatCompletionResponse, request: &ChatRequest) -> Result<ChatResponse> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::malformed("lmstudio", "response has no choices"))?;

        let content = choice.message.content.unwrap_or_default();
        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .iter()
            .map(|c| ToolCall::from_json_arguments(c.id.clone(), &c.function.name, &c.function.arguments))
            .collect();

        let reported = response.usage.unwrap_or_default();
        let usage = usage::reported_or_estimated(
            reported.prompt_tokens,
            reported.completion_tokens,
            reported.total_tokens,
            request,
            &content,
        );

        let mut finish_reason = choice
            .finish_reason
            .as_deref()
            .map(finish_reason::from_openai_compatible)
            .unwrap_or_default();
        if finish_reason == FinishReason::Stop && !tool_calls.is_empty() {
            finish_reason = FinishReason::ToolUse;
        }

        Ok(ChatResponse {
            id: response
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            model: response
                .model
                .unwrap_or_else(|| request.model_or(&self.model).to_string()),
            content,
            tool_calls,
            usage,
            finish_reason,
        })
    }
}

#[async_trait]
impl LLMProvider for LMStudioProvider {
    fn name(&self) -> &str {
        "lmstudio"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            id: "lmstudio",
            display_name: "LM Studio",
            auth_modes: vec![AuthMode::None, AuthMode::Bearer],
            framing: self.framing,
            local: true,
            supports_thinking: false,
            supports_tools: true,
        }
    }

    #[instrument(skip(self, request), fields(model = %request.model_or(&self.model)))]
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let mut timer = InferenceTimer::start();
        let body = self.build_request(request, false);
        debug!(provider = "lmstudio", host = %self.host, messages = body.messages.len(), "sending chat completion");

        let builder = self.authorize(
            self.client
                .post(http::join_url(&self.host, "/v1/chat/completions"))
                .json(&body),
        );
        let raw: ChatCompletionResponse = http::execute_json("lmstudio", builder, self.timeout).await?;
        let response = self.parse_response(raw, request)?;

        timer.record_text(&response.content);
        self.metrics
            .record(timer.finish(response.model.clone(), response.usage.output_tokens))
            .await;
        Ok(response)
    }

    fn stream(&self, request: &ChatRequest, cancel: CancellationToken) -> EventStream {
        let body = self.build_request(request, true);
        let builder = self.authorize(
            self.client
                .post(http::join_url(&self.host, "/v1/chat/completions"))
                .json(&body),
        );
        let normalizer = EventNormalizer::for_request(request);
        let events = http::event_stream("lmstudio", builder, self.framing, normalizer, cancel);
        instrument_stream(events, Arc::clone(&self.metrics), body.model)
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        let builder = self.authorize(self.client.get(http::join_url(&self.host, "/v1/models")));
        let list: ModelList = http::execute_json("lmstudio", builder, QUICK_TIMEOUT).await?;

        Ok(list
            .data
            .into_iter()
            .filter(|m| !m.id.to_ascii_lowercase().contains("embed"))
            .map(|m| Model {
                display_name: m.id.clone(),
                provider: "lmstudio".to_string(),
                context_window: models::context_window_for(&m.id),
                max_output_tokens: None,
                capabilities: models::capabilities_for(&m.id),
                id: m.id,
            })
            .collect())
    }

    async fn validate_connection(&self) -> bool {
        self.health.check().await.status == HealthStatus::Available
    }
}
