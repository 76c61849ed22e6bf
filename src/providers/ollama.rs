//! Ollama provider for a locally running server.
//!
//! # Environment Variables
//! - `OLLAMA_HOST`: server URL (default: http://localhost:11434)
//! - `OLLAMA_MODEL`: default chat model
//!
//! Streams are newline-delimited JSON from `POST /api/chat`. Each provider
//! owns a [`HealthMonitor`] and a [`MetricsTracker`]; successful calls are
//! recorded into the tracker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
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
use crate::streaming::PayloadMapper;
use crate::traits::{EventStream, LLMProvider};
use crate::types::{
    AuthMode, ChatMessage, ChatRequest, ChatResponse, ChatRole, ContentBlock, Framing, Model,
    ProviderCapabilities, StreamErrorKind, StreamEvent, ToolCall,
};
use crate::usage;

/// Default Ollama server URL
const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

/// Default chat model
const DEFAULT_OLLAMA_MODEL: &str = "llama3.2";

// ============================================================================
// Ollama API request/response structures
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OllamaTool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
    /// Name of the tool a `tool` message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Serialize)]
struct OllamaTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OllamaFunction,
}

#[derive(Debug, Serialize)]
struct OllamaFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OllamaToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    function: OllamaFunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl OllamaToolCall {
    fn to_tool_call(&self) -> ToolCall {
        let id = self
            .id
            .clone()
            .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
        ToolCall::from_value_arguments(id, &self.function.name, &self.function.arguments)
    }
}

/// One chat reply; also the shape of every NDJSON stream line.
#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelsResponse {
    #[serde(default)]
    models: Vec<OllamaModelInfo>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelInfo {
    name: String,
    #[serde(default)]
    details: Option<OllamaModelDetails>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelDetails {
    #[serde(default)]
    parameter_size: Option<String>,
}

// ============================================================================
// Streaming
// ============================================================================

#[derive(Debug, Default)]
struct OllamaMapper {
    started: bool,
    emitted_tool_calls: bool,
    prompt_estimate: u64,
    output_text: String,
}

impl OllamaMapper {
    fn for_request(request: &ChatRequest) -> Self {
        Self {
            prompt_estimate: usage::estimate_request_tokens(request),
            ..Default::default()
        }
    }
}

impl PayloadMapper for OllamaMapper {
    fn map(&mut self, payload: &Value, _event: Option<&str>) -> Vec<StreamEvent> {
        if let Some(error) = payload.get("error") {
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return vec![StreamEvent::error(StreamErrorKind::Provider, message)];
        }

        let chunk: OllamaChatChunk = match serde_json::from_value(payload.clone()) {
            Ok(chunk) => chunk,
            Err(e) => {
                return vec![StreamEvent::error(
                    StreamErrorKind::Protocol,
                    format!("malformed Ollama chunk: {}", e),
                )]
            }
        };

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                message_id: uuid::Uuid::new_v4().to_string(),
                conversation_id: None,
                model: chunk.model.clone(),
            });
        }

        if let Some(message) = &chunk.message {
            if !message.content.is_empty() {
                self.output_text.push_str(&message.content);
                events.push(StreamEvent::token(message.content.as_str()));
            }
            for call in &message.tool_calls {
                self.emitted_tool_calls = true;
                events.push(StreamEvent::ToolCallStart {
                    tool_call: call.to_tool_call(),
                });
            }
        }

        if chunk.done {
            // prompt_eval_count is omitted when the prompt was served from cache.
            events.push(StreamEvent::done(
                usage::fill_missing(
                    chunk.prompt_eval_count,
                    chunk.eval_count,
                    None,
                    self.prompt_estimate,
                    &self.output_text,
                ),
                finish_reason::from_ollama(chunk.done_reason.as_deref(), self.emitted_tool_calls),
            ));
        }
        events
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Ollama chat provider.
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: Client,
    host: String,
    model: String,
    timeout: Duration,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsTracker>,
}

/// Builder for OllamaProvider
#[derive(Debug, Clone)]
pub struct OllamaProviderBuilder {
    host: String,
    model: String,
    timeout: Duration,
    metrics_capacity: usize,
}

impl Default for OllamaProviderBuilder {
    fn default() -> Self {
        Self {
            host: DEFAULT_OLLAMA_HOST.to_string(),
            model: DEFAULT_OLLAMA_MODEL.to_string(),
            timeout: DEFAULT_LOCAL_TIMEOUT,
            metrics_capacity: crate::metrics::DEFAULT_METRICS_CAPACITY,
        }
    }
}

impl OllamaProviderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the Ollama host URL
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the chat model
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Timeout for non-streaming calls.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of retained performance samples.
    pub fn metrics_capacity(mut self, capacity: usize) -> Self {
        self.metrics_capacity = capacity;
        self
    }

    /// Build the OllamaProvider
    pub fn build(self) -> Result<OllamaProvider> {
        let client = Client::builder()
            .no_proxy() // local server; never route through a proxy
            .build()
            .map_err(|e| LlmError::ConfigError(format!("failed to build HTTP client: {}", e)))?;

        let health = HealthMonitor::new(client.clone(), self.host.clone(), Some(BackendKind::Ollama));

        Ok(OllamaProvider {
            client,
            host: self.host,
            model: self.model,
            timeout: self.timeout,
            health: Arc::new(health),
            metrics: Arc::new(MetricsTracker::new(self.metrics_capacity)),
        })
    }
}

impl OllamaProvider {
    /// Create from `OLLAMA_HOST` and `OLLAMA_MODEL`, with local defaults.
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| DEFAULT_OLLAMA_HOST.to_string());
        let model =
            std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| DEFAULT_OLLAMA_MODEL.to_string());
        OllamaProviderBuilder::new().host(host).model(model).build()
    }

    pub fn builder() -> OllamaProviderBuilder {
        OllamaProviderBuilder::new()
    }

    /// Create with default settings (localhost:11434)
    pub fn default_local() -> Result<Self> {
        OllamaProviderBuilder::new().build()
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

    fn convert_messages(system_prompt: Option<&str>, messages: &[ChatMessage]) -> Vec<OllamaMessage> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system_prompt {
            out.push(Self::message("system", system.to_string()));
        }

        let mut names_by_id: Vec<(String, String)> = Vec::new();
        for msg in messages {
            let mut text = String::new();
            let mut tool_calls = Vec::new();
            let mut results = Vec::new();
            for block in msg.content.blocks() {
                match block {
                    ContentBlock::Text { text: t } => text.push_str(&t),
                    ContentBlock::ToolUse { id, name, input } => {
                        names_by_id.push((id.clone(), name.clone()));
                        tool_calls.push(OllamaToolCall {
                            id: None,
                            function: OllamaFunctionCall {
                                name,
                                arguments: Value::Object(input),
                            },
                        });
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => results.push((tool_use_id, content)),
                }
            }

            if msg.role == ChatRole::Tool && results.is_empty() {
                if let Some(id) = &msg.tool_call_id {
                    results.push((id.clone(), std::mem::take(&mut text)));
                }
            }

            for (call_id, content) in results {
                let tool_name = names_by_id
                    .iter()
                    .rev()
                    .find(|(id, _)| *id == call_id)
                    .map(|(_, name)| name.clone());
                out.push(OllamaMessage {
                    tool_name,
                    ..Self::message("tool", content)
                });
            }

            if !text.is_empty() || !tool_calls.is_empty() {
                let role = match msg.role {
                    ChatRole::System => "system",
                    ChatRole::Assistant => "assistant",
                    ChatRole::User | ChatRole::Tool => "user",
                };
                out.push(OllamaMessage {
                    tool_calls,
                    ..Self::message(role, text)
                });
            }
        }
        out
    }

    fn message(role: &str, content: String) -> OllamaMessage {
        OllamaMessage {
            role: role.to_string(),
            content,
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> OllamaChatRequest {
        let options = (request.temperature.is_some() || request.max_tokens.is_some()).then(|| {
            ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            }
        });

        OllamaChatRequest {
            model: request.model_or(&self.model).to_string(),
            messages: Self::convert_messages(request.system_prompt.as_deref(), &request.messages),
            stream,
            options,
            think: request.thinking.map(|_| true),
            tools: request
                .tools
                .iter()
                .map(|t| OllamaTool {
                    kind: "function",
                    function: OllamaFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        }
    }

    fn parse_response(&self, chunk: OllamaChatChunk, request: &ChatRequest) -> ChatResponse {
        let message = chunk.message.unwrap_or_else(|| Self::message("assistant", String::new()));
        let tool_calls: Vec<ToolCall> = message.tool_calls.iter().map(OllamaToolCall::to_tool_call).collect();
        let usage = usage::reported_or_estimated(
            chunk.prompt_eval_count,
            chunk.eval_count,
            None,
            request,
            &message.content,
        );

        ChatResponse {
            id: uuid::Uuid::new_v4().to_string(),
            model: chunk
                .model
                .unwrap_or_else(|| request.model_or(&self.model).to_string()),
            finish_reason: finish_reason::from_ollama(chunk.done_reason.as_deref(), !tool_calls.is_empty()),
            content: message.content,
            tool_calls,
            usage,
        }
    }
}

#[async_trait]
impl LLMProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            id: "ollama",
            display_name: "Ollama",
            auth_modes: vec![AuthMode::None],
            framing: Framing::Ndjson,
            local: true,
            supports_thinking: true,
            supports_tools: true,
        }
    }

    #[instrument(skip(self, request), fields(model = %request.model_or(&self.model)))]
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let mut timer = InferenceTimer::start();
        let body = self.build_request(request, false);
        debug!(provider = "ollama", host = %self.host, messages = body.messages.len(), "sending chat request");

        let builder = self
            .client
            .post(http::join_url(&self.host, "/api/chat"))
            .json(&body);
        let chunk: OllamaChatChunk = http::execute_json("ollama", builder, self.timeout).await?;
        let response = self.parse_response(chunk, request);

        timer.record_text(&response.content);
        self.metrics
            .record(timer.finish(response.model.clone(), response.usage.output_tokens))
            .await;
        Ok(response)
    }

    fn stream(&self, request: &ChatRequest, cancel: CancellationToken) -> EventStream {
        let body = self.build_request(request, true);
        let builder = self
            .client
            .post(http::join_url(&self.host, "/api/chat"))
            .json(&body);
        let mapper = OllamaMapper::for_request(request);
        let events = http::event_stream("ollama", builder, Framing::Ndjson, mapper, cancel);
        instrument_stream(events, Arc::clone(&self.metrics), body.model)
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        let builder = self.client.get(http::join_url(&self.host, "/api/tags"));
        let tags: OllamaModelsResponse = http::execute_json("ollama", builder, QUICK_TIMEOUT).await?;
        debug!(provider = "ollama", count = tags.models.len(), "listed local models");

        Ok(tags
            .models
            .into_iter()
            .map(|m| {
                let display_name = match m.details.and_then(|d| d.parameter_size) {
                    Some(size) => format!("{} ({})", m.name, size),
                    None => m.name.clone(),
                };
                Model {
                    display_name,
                    provider: "ollama".to_string(),
                    context_window: models::context_window_for(&m.name),
                    max_output_tokens: None,
                    capabilities: models::capabilities_for(&m.name),
                    id: m.name,
                }
            })
            .collect())
    }

    async fn validate_connection(&self) -> bool {
        self.health.check().await.status == HealthStatus::Available
    }
}
