//! Anthropic (Claude) provider.
//!
//! Uses the Messages API (`POST /v1/messages`).
//!
//! # Environment Variables
//! - `ANTHROPIC_API_KEY`: API key for Anthropic API
//! - `ANTHROPIC_BASE_URL`: custom endpoint (proxies, gateways)
//! - `ANTHROPIC_MODEL`: default model
//!
//! # Example
//! ```ignore
//! use switchyard_llm::{AnthropicProvider, ChatMessage, ChatRequest, LLMProvider};
//!
//! let provider = AnthropicProvider::new("your-api-key");
//! let request = ChatRequest::new("", vec![ChatMessage::user("Hello!")]);
//! let response = provider.chat(&request).await?;
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{LlmError, Result};
use crate::finish_reason;
use crate::models;
use crate::providers::http::{self, DEFAULT_REQUEST_TIMEOUT, QUICK_TIMEOUT};
use crate::streaming::EventNormalizer;
use crate::thinking::{self, ThinkingPolicy};
use crate::traits::{EventStream, LLMProvider};
use crate::types::{
    AuthMode, ChatMessage, ChatRequest, ChatResponse, ChatRole, ContentBlock, FinishReason,
    Framing, MessageContent, Model, ModelCapability, ProviderCapabilities, ToolCall,
};
use crate::usage;

/// Anthropic API base URL
const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";

/// Anthropic API version (required header)
const ANTHROPIC_API_VERSION: &str = "2023-06-01";

/// Default model
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

/// Static catalog: (id, display name).
const CATALOG: &[(&str, &str)] = &[
    ("claude-opus-4-1-20250805", "Claude Opus 4.1"),
    ("claude-sonnet-4-5-20250929", "Claude Sonnet 4.5"),
    ("claude-sonnet-4-20250514", "Claude Sonnet 4"),
    ("claude-3-7-sonnet-20250219", "Claude Sonnet 3.7"),
    ("claude-3-5-haiku-20241022", "Claude Haiku 3.5"),
];

// ============================================================================
// Anthropic API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: String,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Clone, Serialize)]
struct ThinkingParam {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

/// Request body for messages endpoint
#[derive(Debug, Clone, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingParam>,
}

/// Response from messages endpoint
#[derive(Debug, Clone, Deserialize)]
struct MessagesResponse {
    id: String,
    model: String,
    content: Vec<AnthropicBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct AnthropicUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

// ============================================================================
// AnthropicProvider Implementation
// ============================================================================

/// Anthropic (Claude) provider.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    api_version: String,
    timeout: Duration,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: ANTHROPIC_API_BASE.to_string(),
            api_version: ANTHROPIC_API_VERSION.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Create a provider from environment variables.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            LlmError::ConfigError("ANTHROPIC_API_KEY environment variable not set".to_string())
        })?;

        let mut provider = Self::new(api_key);
        if let Ok(base_url) = std::env::var("ANTHROPIC_BASE_URL") {
            provider = provider.with_base_url(base_url);
        }
        if let Ok(model) = std::env::var("ANTHROPIC_MODEL") {
            provider = provider.with_model(model);
        }
        Ok(provider)
    }

    /// Set the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set a custom base URL (for proxies or alternative endpoints).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set a custom API version.
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Timeout for non-streaming calls.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        http::join_url(&self.base_url, "/v1/messages")
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|_| LlmError::ConfigError("API key is not a valid header value".into()))?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_str(&self.api_version)
                .map_err(|_| LlmError::ConfigError("invalid anthropic-version".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Convert canonical messages to Anthropic format.
    ///
    /// System messages are lifted into the dedicated `system` field. Tool
    /// results travel as `tool_result` blocks inside a user turn, and
    /// consecutive turns of the same role are merged.
    fn convert_messages(
        system_prompt: Option<&str>,
        messages: &[ChatMessage],
    ) -> (Option<String>, Vec<AnthropicMessage>) {
        let mut system_parts: Vec<String> = system_prompt.map(str::to_string).into_iter().collect();
        let mut converted: Vec<AnthropicMessage> = Vec::new();

        for msg in messages {
            let (role, blocks) = match msg.role {
                ChatRole::System => {
                    system_parts.push(msg.text());
                    continue;
                }
                ChatRole::User => ("user", Self::convert_blocks(&msg.content)),
                ChatRole::Assistant => ("assistant", Self::convert_blocks(&msg.content)),
                ChatRole::Tool => ("user", Self::tool_result_blocks(msg)),
            };
            if blocks.is_empty() {
                continue;
            }
            match converted.last_mut() {
                Some(last) if last.role == role => last.content.extend(blocks),
                _ => converted.push(AnthropicMessage {
                    role,
                    content: blocks,
                }),
            }
        }

        let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
        (system, converted)
    }

    fn convert_blocks(content: &MessageContent) -> Vec<AnthropicBlock> {
        content
            .blocks()
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if text.is_empty() => None,
                ContentBlock::Text { text } => Some(AnthropicBlock::Text { text }),
                ContentBlock::ToolUse { id, name, input } => Some(AnthropicBlock::ToolUse {
                    id,
                    name,
                    input: Value::Object(input),
                }),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => Some(AnthropicBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                }),
            })
            .collect()
    }

    fn tool_result_blocks(msg: &ChatMessage) -> Vec<AnthropicBlock> {
        match (&msg.content, &msg.tool_call_id) {
            (MessageContent::Text(text), Some(id)) => vec![AnthropicBlock::ToolResult {
                tool_use_id: id.clone(),
                content: text.clone(),
                is_error: false,
            }],
            _ => Self::convert_blocks(&msg.content),
        }
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> MessagesRequest {
        let model = request.model_or(&self.model).to_string();
        let (system, messages) =
            Self::convert_messages(request.system_prompt.as_deref(), &request.messages);

        let plan = thinking::resolve(
            request.thinking,
            request.max_tokens,
            models::max_output_for(&model),
            &ThinkingPolicy::ANTHROPIC,
        );

        let tools = request
            .tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect();

        MessagesRequest {
            model,
            max_tokens: plan.max_tokens,
            messages,
            system,
            stream: stream.then_some(true),
            tools,
            // Extended thinking rejects a custom temperature.
            temperature: if plan.enabled() {
                None
            } else {
                request.temperature
            },
            thinking: plan.budget.map(|budget_tokens| ThinkingParam {
                kind: "enabled",
                budget_tokens,
            }),
        }
    }

    fn parse_response(response: MessagesResponse, request: &ChatRequest) -> ChatResponse {
        let mut content = String::new();
        let mut tool_calls = Vec::new();

        for block in response.content {
            match block {
                AnthropicBlock::Text { text } => content.push_str(&text),
                AnthropicBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall::from_value_arguments(id, name, &input))
                }
                _ => {}
            }
        }

        let usage_report = response.usage.unwrap_or_default();
        let usage = usage::reported_or_estimated(
            usage_report.input_tokens,
            usage_report.output_tokens,
            None,
            request,
            &content,
        );

        let finish_reason = match response.stop_reason.as_deref() {
            Some(reason) => finish_reason::from_anthropic(reason),
            None if !tool_calls.is_empty() => FinishReason::ToolUse,
            None => FinishReason::Stop,
        };

        ChatResponse {
            id: response.id,
            model: response.model,
            content,
            tool_calls,
            usage,
            finish_reason,
        }
    }

    /// Context window for a Claude model id.
    pub fn context_length_for_model(model: &str) -> u32 {
        models::context_window_for(model)
    }
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            id: "anthropic",
            display_name: "Anthropic",
            auth_modes: vec![AuthMode::ApiKeyHeader],
            framing: Framing::Sse,
            local: false,
            supports_thinking: true,
            supports_tools: true,
        }
    }

    #[instrument(skip(self, request), fields(model = %request.model_or(&self.model)))]
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_request(request, false);
        debug!(
            provider = "anthropic",
            messages = body.messages.len(),
            max_tokens = body.max_tokens,
            thinking = body.thinking.is_some(),
            "sending messages request"
        );

        let builder = self
            .client
            .post(self.endpoint())
            .headers(self.headers()?)
            .json(&body);
        let response: MessagesResponse =
            http::execute_json("anthropic", builder, self.timeout).await?;
        Ok(Self::parse_response(response, request))
    }

    fn stream(&self, request: &ChatRequest, cancel: CancellationToken) -> EventStream {
        let headers = match self.headers() {
            Ok(h) => h,
            Err(e) => return http::failed_stream(e),
        };
        let body = self.build_request(request, true);
        let builder = self
            .client
            .post(self.endpoint())
            .headers(headers)
            .header("accept", "text/event-stream")
            .json(&body);
        let normalizer = EventNormalizer::for_request(request);
        http::event_stream("anthropic", builder, Framing::Sse, normalizer, cancel)
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        Ok(CATALOG
            .iter()
            .map(|(id, display)| Model {
                id: id.to_string(),
                display_name: display.to_string(),
                provider: "anthropic".to_string(),
                context_window: models::context_window_for(id),
                max_output_tokens: models::max_output_for(id),
                capabilities: vec![
                    ModelCapability::Chat,
                    ModelCapability::Streaming,
                    ModelCapability::ToolUse,
                    ModelCapability::Vision,
                ],
            })
            .collect())
    }

    async fn validate_connection(&self) -> bool {
        let Ok(headers) = self.headers() else {
            return false;
        };
        let builder = self
            .client
            .get(http::join_url(&self.base_url, "/v1/models"))
            .headers(headers);
        match http::execute_json::<HashMap<String, Value>>("anthropic", builder, QUICK_TIMEOUT).await
        {
            Ok(_) => true,
            Err(e) => {
                debug!(provider = "anthropic", error = %e, "connection check failed");
                false
            }
        }
    }
}
