//! OpenAI provider over the Responses API (`POST /v1/responses`).
//!
//! # Environment Variables
//! - `OPENAI_API_KEY`: API key (required)
//! - `OPENAI_BASE_URL`: custom endpoint, e.g. a proxy
//! - `OPENAI_MODEL`: default model
//!
//! System messages and the request's system prompt are sent as
//! `instructions`. Tool turns become `function_call` / `function_call_output`
//! input items.

use std::time::Duration;

use async_trait::async_trait;
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
    AuthMode, ChatMessage, ChatRequest, ChatResponse, ChatRole, ContentBlock, Framing, Model,
    ModelCapability, ProviderCapabilities, ToolCall,
};
use crate::usage;

const OPENAI_API_BASE: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4.1-mini";

/// Model id prefixes that accept the Responses API for chat.
const CHAT_FAMILIES: &[&str] = &["gpt-", "o1", "o3", "o4", "chatgpt-"];

/// Non-chat variants sharing a chat prefix.
const EXCLUDED_MARKERS: &[&str] = &[
    "embedding",
    "tts",
    "whisper",
    "transcribe",
    "audio",
    "realtime",
    "image",
    "search",
];

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputItem {
    Message {
        role: &'static str,
        content: String,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Clone, Serialize)]
struct FunctionTool {
    #[serde(rename = "type")]
    kind: &'static str,
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Clone, Serialize)]
struct Reasoning {
    effort: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ResponsesRequest {
    model: String,
    input: Vec<InputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<Reasoning>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<FunctionTool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    store: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponsesResponse {
    id: String,
    model: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    FunctionCall {
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputContent {
    OutputText {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct IncompleteDetails {
    reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResponsesUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

// ============================================================================
// OpenAIProvider
// ============================================================================

/// OpenAI Responses API provider.
#[derive(Debug, Clone)]
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: OPENAI_API_BASE.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Create a provider from `OPENAI_API_KEY`, `OPENAI_BASE_URL` and `OPENAI_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            LlmError::ConfigError("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        let mut provider = Self::new(api_key);
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            provider = provider.with_base_url(url);
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            provider = provider.with_model(model);
        }
        Ok(provider)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Base URL without the `/v1` suffix.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        let trimmed = url.trim_end_matches('/');
        self.base_url = trimmed.strip_suffix("/v1").unwrap_or(trimmed).to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        http::join_url(&self.base_url, path)
    }

    /// Flatten chat turns into Responses input items, keeping the order of
    /// text and tool blocks within each turn.
    fn convert_input(messages: &[ChatMessage], instructions: &mut Vec<String>) -> Vec<InputItem> {
        let mut items = Vec::with_capacity(messages.len());
        for msg in messages {
            if msg.role == ChatRole::System {
                instructions.push(msg.text());
                continue;
            }
            let role = if msg.role == ChatRole::Assistant {
                "assistant"
            } else {
                "user"
            };
            // A plain-text tool reply becomes one function_call_output.
            let reply_to = match msg.role {
                ChatRole::Tool => msg.tool_call_id.clone(),
                _ => None,
            };

            let mut text = String::new();
            for block in msg.content.blocks() {
                match block {
                    ContentBlock::Text { text: t } => text.push_str(&t),
                    ContentBlock::ToolUse { id, name, input } => {
                        if reply_to.is_none() {
                            flush_message(&mut items, role, &mut text);
                        }
                        items.push(InputItem::FunctionCall {
                            call_id: id,
                            name,
                            arguments: Value::Object(input).to_string(),
                        });
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        if reply_to.is_none() {
                            flush_message(&mut items, role, &mut text);
                        }
                        items.push(InputItem::FunctionCallOutput {
                            call_id: tool_use_id,
                            output: content,
                        });
                    }
                }
            }
            match reply_to {
                Some(call_id) if !text.is_empty() => items.push(InputItem::FunctionCallOutput {
                    call_id,
                    output: text,
                }),
                _ => flush_message(&mut items, role, &mut text),
            }
        }
        items
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> ResponsesRequest {
        let model = request.model_or(&self.model).to_string();
        let mut instructions: Vec<String> = request.system_prompt.iter().cloned().collect();
        let input = Self::convert_input(&request.messages, &mut instructions);

        let plan = thinking::resolve(
            request.thinking,
            request.max_tokens,
            models::max_output_for(&model),
            &ThinkingPolicy::OPENAI,
        );
        let max_output_tokens = (request.max_tokens.is_some() || request.thinking.is_some())
            .then_some(plan.max_tokens);

        ResponsesRequest {
            model,
            input,
            instructions: (!instructions.is_empty()).then(|| instructions.join("\n\n")),
            max_output_tokens,
            // Reasoning models reject sampling parameters.
            temperature: request.thinking.is_none().then_some(request.temperature).flatten(),
            reasoning: request.thinking.map(|level| Reasoning {
                effort: level.as_str(),
            }),
            tools: request
                .tools
                .iter()
                .map(|t| FunctionTool {
                    kind: "function",
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                })
                .collect(),
            stream,
            store: false,
        }
    }

    fn parse_response(response: ResponsesResponse, request: &ChatRequest) -> ChatResponse {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for item in response.output {
            match item {
                OutputItem::Message { content: parts } => {
                    for part in parts {
                        if let OutputContent::OutputText { text } = part {
                            content.push_str(&text);
                        }
                    }
                }
                OutputItem::FunctionCall {
                    call_id,
                    id,
                    name,
                    arguments,
                } => {
                    let id = call_id.or(id).unwrap_or_default();
                    tool_calls.push(ToolCall::from_json_arguments(id, name, &arguments));
                }
                OutputItem::Other => {}
            }
        }

        let reported = response.usage.unwrap_or_default();
        let usage = usage::reported_or_estimated(
            reported.input_tokens,
            reported.output_tokens,
            reported.total_tokens,
            request,
            &content,
        );
        let finish_reason = finish_reason::from_responses_status(
            response.status.as_deref().unwrap_or("completed"),
            response
                .incomplete_details
                .as_ref()
                .and_then(|d| d.reason.as_deref()),
            !tool_calls.is_empty(),
        );

        ChatResponse {
            id: response.id,
            model: response.model,
            content,
            tool_calls,
            usage,
            finish_reason,
        }
    }

    fn is_chat_model(id: &str) -> bool {
        CHAT_FAMILIES.iter().any(|p| id.starts_with(p))
            && !EXCLUDED_MARKERS.iter().any(|m| id.contains(m))
    }
}

/// Push accumulated turn text as a message item and clear it.
fn flush_message(items: &mut Vec<InputItem>, role: &'static str, text: &mut String) {
    if !text.is_empty() {
        items.push(InputItem::Message {
            role,
            content: std::mem::take(text),
        });
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            id: "openai",
            display_name: "OpenAI",
            auth_modes: vec![AuthMode::Bearer],
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
            provider = "openai",
            items = body.input.len(),
            reasoning = body.reasoning.is_some(),
            "sending responses request"
        );
        let builder = self
            .client
            .post(self.url("/v1/responses"))
            .bearer_auth(&self.api_key)
            .json(&body);
        let response: ResponsesResponse = http::execute_json("openai", builder, self.timeout).await?;
        Ok(Self::parse_response(response, request))
    }

    fn stream(&self, request: &ChatRequest, cancel: CancellationToken) -> EventStream {
        let body = self.build_request(request, true);
        let builder = self
            .client
            .post(self.url("/v1/responses"))
            .bearer_auth(&self.api_key)
            .header("accept", "text/event-stream")
            .json(&body);
        let normalizer = EventNormalizer::for_request(request);
        http::event_stream("openai", builder, Framing::Sse, normalizer, cancel)
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        let builder = self
            .client
            .get(self.url("/v1/models"))
            .bearer_auth(&self.api_key);
        let list: ModelList = http::execute_json("openai", builder, QUICK_TIMEOUT).await?;

        let mut models: Vec<Model> = list
            .data
            .into_iter()
            .filter(|m| Self::is_chat_model(&m.id))
            .map(|m| {
                let mut capabilities = vec![
                    ModelCapability::Chat,
                    ModelCapability::Streaming,
                    ModelCapability::ToolUse,
                ];
                if m.id.contains("gpt-4o") || m.id.contains("gpt-4.1") || m.id.contains("gpt-5") {
                    capabilities.push(ModelCapability::Vision);
                }
                Model {
                    display_name: m.id.clone(),
                    provider: "openai".to_string(),
                    context_window: models::context_window_for(&m.id),
                    max_output_tokens: models::max_output_for(&m.id),
                    capabilities,
                    id: m.id,
                }
            })
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }

    async fn validate_connection(&self) -> bool {
        match self.list_models().await {
            Ok(_) => true,
            Err(e) => {
                debug!(provider = "openai", error = %e, "connection check failed");
                false
            }
        }
    }
}
