//! Google Gemini provider (Generative Language API, `v1beta`).
//!
//! # Environment Variables
//! - `GEMINI_API_KEY` (or `GOOGLE_API_KEY`): API key
//! - `GEMINI_BASE_URL`: custom endpoint
//! - `GEMINI_MODEL`: default model
//!
//! Gemini streams candidate snapshots rather than typed events, so the
//! stream uses its own [`PayloadMapper`] instead of the shared normalizer.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{LlmError, Result};
use crate::finish_reason;
use crate::models;
use crate::providers::http::{self, DEFAULT_REQUEST_TIMEOUT, QUICK_TIMEOUT};
use crate::streaming::PayloadMapper;
use crate::thinking::{self, ThinkingPolicy};
use crate::traits::{EventStream, LLMProvider};
use crate::types::{
    AuthMode, ChatMessage, ChatRequest, ChatResponse, ChatRole, ContentBlock, Framing, Model,
    ModelCapability, ProviderCapabilities, StreamErrorKind, StreamEvent, ToolCall,
};
use crate::usage;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    /// Marks a reasoning summary part; never surfaced as answer text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    fn is_thought(&self) -> bool {
        self.thought.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Tool {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    response_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
    total_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelInfo {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    input_token_limit: Option<u32>,
    #[serde(default)]
    output_token_limit: Option<u32>,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

fn call_id(call: &FunctionCall) -> String {
    call.id
        .clone()
        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()))
}

// ============================================================================
// Streaming
// ============================================================================

/// Maps `streamGenerateContent` chunks to canonical events.
#[derive(Debug, Default)]
struct GeminiMapper {
    model: String,
    started: bool,
    emitted_tool_calls: bool,
    prompt_estimate: u64,
    output_text: String,
}

impl GeminiMapper {
    fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    fn for_request(model: impl Into<String>, request: &ChatRequest) -> Self {
        Self {
            prompt_estimate: usage::estimate_request_tokens(request),
            ..Self::new(model)
        }
    }
}

impl PayloadMapper for GeminiMapper {
    fn map(&mut self, payload: &Value, _event: Option<&str>) -> Vec<StreamEvent> {
        if let Some(error) = payload.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return vec![StreamEvent::error(StreamErrorKind::Provider, message)];
        }

        let chunk: GenerateContentResponse = match serde_json::from_value(payload.clone()) {
            Ok(chunk) => chunk,
            Err(e) => {
                return vec![StreamEvent::error(
                    StreamErrorKind::Protocol,
                    format!("malformed Gemini chunk: {}", e),
                )]
            }
        };

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                message_id: chunk
                    .response_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                conversation_id: None,
                model: Some(chunk.model_version.clone().unwrap_or_else(|| self.model.clone())),
            });
        }

        let Some(candidate) = chunk.candidates.first() else {
            return events;
        };

        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if part.is_thought() {
                    continue;
                }
                if let Some(text) = part.text.as_deref().filter(|t| !t.is_empty()) {
                    self.output_text.push_str(text);
                    events.push(StreamEvent::token(text));
                }
                if let Some(call) = &part.function_call {
                    self.emitted_tool_calls = true;
                    events.push(StreamEvent::ToolCallStart {
                        tool_call: ToolCall::from_value_arguments(call_id(call), &call.name, &call.args),
                    });
                }
            }
        }

        if let Some(reason) = candidate.finish_reason.as_deref() {
            let meta = chunk.usage_metadata.clone().unwrap_or_default();
            let usage = usage::fill_missing(
                meta.prompt_token_count,
                meta.candidates_token_count,
                meta.total_token_count,
                self.prompt_estimate,
                &self.output_text,
            );
            events.push(StreamEvent::done(
                usage,
                finish_reason::from_gemini(reason, self.emitted_tool_calls),
            ));
        }
        events
    }
}

// ============================================================================
// GeminiProvider
// ============================================================================

/// Google Gemini provider.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: GEMINI_API_BASE.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Create from `GEMINI_API_KEY` (falling back to `GOOGLE_API_KEY`).
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .map_err(|_| {
                LlmError::ConfigError(
                    "GEMINI_API_KEY or GOOGLE_API_KEY environment variable not set".to_string(),
                )
            })?;
        let mut provider = Self::new(api_key);
        if let Ok(url) = std::env::var("GEMINI_BASE_URL") {
            provider = provider.with_base_url(url);
        }
        if let Ok(model) = std::env::var("GEMINI_MODEL") {
            provider = provider.with_model(model);
        }
        Ok(provider)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-goog-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|_| LlmError::ConfigError("API key is not a valid header value".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn model_url(&self, model: &str, action: &str) -> String {
        http::join_url(&self.base_url, &format!("/v1beta/models/{}:{}", model, action))
    }

    /// Convert messages to `contents`, lifting system turns out.
    ///
    /// A `functionResponse` must carry the function *name*, which canonical
    /// tool results only reference by call id; the name is recovered from the
    /// matching earlier tool use.
    fn convert_contents(messages: &[ChatMessage], system_parts: &mut Vec<String>) -> Vec<Content> {
        let mut names_by_id: Vec<(String, String)> = Vec::new();
        let mut contents: Vec<Content> = Vec::new();

        for msg in messages {
            let role = match msg.role {
                ChatRole::System => {
                    system_parts.push(msg.text());
                    continue;
                }
                ChatRole::Assistant => "model",
                ChatRole::User | ChatRole::Tool => "user",
            };

            let mut parts = Vec::new();
            for block in msg.content.blocks() {
                match block {
                    ContentBlock::Text { text } if text.is_empty() => {}
                    ContentBlock::Text { text } if msg.role == ChatRole::Tool => {
                        let id = msg.tool_call_id.clone().unwrap_or_default();
                        parts.push(Self::function_response(&names_by_id, &id, text, false));
                    }
                    ContentBlock::Text { text } => parts.push(Part::text(text)),
                    ContentBlock::ToolUse { id, name, input } => {
                        names_by_id.push((id.clone(), name.clone()));
                        parts.push(Part {
                            function_call: Some(FunctionCall {
                                id: None,
                                name,
                                args: Value::Object(input),
                            }),
                            ..Default::default()
                        });
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => parts.push(Self::function_response(
                        &names_by_id,
                        &tool_use_id,
                        content,
                        is_error,
                    )),
                }
            }
            if parts.is_empty() {
                continue;
            }

            match contents.last_mut() {
                Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
                _ => contents.push(Content {
                    role: Some(role.to_string()),
                    parts,
                }),
            }
        }
        contents
    }

    fn function_response(
        names_by_id: &[(String, String)],
        call_id: &str,
        content: String,
        is_error: bool,
    ) -> Part {
        let name = names_by_id
            .iter()
            .rev()
            .find(|(id, _)| id == call_id)
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| call_id.to_string());
        let key = if is_error { "error" } else { "content" };
        let mut response = Map::new();
        response.insert(key.to_string(), Value::String(content));
        Part {
            function_response: Some(FunctionResponse {
                name,
                response: Value::Object(response),
            }),
            ..Default::default()
        }
    }

    fn build_request(&self, request: &ChatRequest) -> GenerateContentRequest {
        let model = request.model_or(&self.model);
        let mut system_parts: Vec<String> = request.system_prompt.iter().cloned().collect();
        let contents = Self::convert_contents(&request.messages, &mut system_parts);

        let plan = thinking::resolve(
            request.thinking,
            request.max_tokens,
            models::max_output_for(model),
            &ThinkingPolicy::GEMINI,
        );
        let max_output_tokens = (request.max_tokens.is_some() || request.thinking.is_some())
            .then_some(plan.max_tokens);

        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![Tool {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|t| FunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }]
        };

        GenerateContentRequest {
            contents,
            system_instruction: (!system_parts.is_empty()).then(|| Content {
                role: None,
                parts: vec![Part::text(system_parts.join("\n\n"))],
            }),
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens,
                thinking_config: plan.budget.map(|thinking_budget| ThinkingConfig { thinking_budget }),
            },
            tools,
        }
    }

    /// Only the first candidate is read; `candidateCount` is never requested.
    fn parse_response(
        &self,
        response: GenerateContentResponse,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::malformed("gemini", "response has no candidates"))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if part.is_thought() {
                continue;
            }
            if let Some(text) = &part.text {
                content.push_str(text);
            }
            if let Some(call) = &part.function_call {
                tool_calls.push(ToolCall::from_value_arguments(call_id(call), &call.name, &call.args));
            }
        }

        let meta = response.usage_metadata.unwrap_or_default();
        let usage = usage::reported_or_estimated(
            meta.prompt_token_count,
            meta.candidates_token_count,
            meta.total_token_count,
            request,
            &content,
        );
        let finish_reason = finish_reason::from_gemini(
            candidate.finish_reason.as_deref().unwrap_or("STOP"),
            !tool_calls.is_empty(),
        );

        Ok(ChatResponse {
            id: response
                .response_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            model: response
                .model_version
                .unwrap_or_else(|| request.model_or(&self.model).to_string()),
            content,
            tool_calls,
            usage,
            finish_reason,
        })
    }
}

#[async_trait]
impl LLMProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            id: "gemini",
            display_name: "Google Gemini",
            auth_modes: vec![AuthMode::ApiKeyHeader],
            framing: Framing::Sse,
            local: false,
            supports_thinking: true,
            supports_tools: true,
        }
    }

    #[instrument(skip(self, request), fields(model = %request.model_or(&self.model)))]
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let model = request.model_or(&self.model);
        let body = self.build_request(request);
        debug!(
            provider = "gemini",
            contents = body.contents.len(),
            thinking = body.generation_config.thinking_config.is_some(),
            "sending generateContent request"
        );
        let builder = self
            .client
            .post(self.model_url(model, "generateContent"))
            .headers(self.headers()?)
            .json(&body);
        let response: GenerateContentResponse =
            http::execute_json("gemini", builder, self.timeout).await?;
        self.parse_response(response, request)
    }

    fn stream(&self, request: &ChatRequest, cancel: CancellationToken) -> EventStream {
        let headers = match self.headers() {
            Ok(h) => h,
            Err(e) => return http::failed_stream(e),
        };
        let model = request.model_or(&self.model).to_string();
        let body = self.build_request(request);
        let builder = self
            .client
            .post(self.model_url(&model, "streamGenerateContent"))
            .query(&[("alt", "sse")])
            .headers(headers)
            .json(&body);
        let mapper = GeminiMapper::for_request(model, request);
        http::event_stream("gemini", builder, Framing::Sse, mapper, cancel)
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        let builder = self
            .client
            .get(http::join_url(&self.base_url, "/v1beta/models"))
            .query(&[("pageSize", "1000")])
            .headers(self.headers()?);
        let list: ModelList = http::execute_json("gemini", builder, QUICK_TIMEOUT).await?;

        Ok(list
            .models
            .into_iter()
            .filter(|m| m.supported_generation_methods.iter().any(|g| g == "generateContent"))
            .map(|m| {
                let id = m.name.strip_prefix("models/").unwrap_or(&m.name).to_string();
                let mut capabilities = vec![
                    ModelCapability::Chat,
                    ModelCapability::Streaming,
                    ModelCapability::ToolUse,
                ];
                if id.starts_with("gemini") {
                    capabilities.push(ModelCapability::Vision);
                }
                Model {
                    display_name: m.display_name.unwrap_or_else(|| id.clone()),
                    provider: "gemini".to_string(),
                    context_window: m
                        .input_token_limit
                        .unwrap_or_else(|| models::context_window_for(&id)),
                    max_output_tokens: m.output_token_limit.or_else(|| models::max_output_for(&id)),
                    capabilities,
                    id,
                }
            })
            .collect())
    }

    async fn validate_connection(&self) -> bool {
        match self.list_models().await {
            Ok(_) => true,
            Err(e) => {
                debug!(provider = "gemini", error = %e, "connection check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FinishReason, ThinkingLevel, TokenUsage};
    use futures::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatRequest {
        ChatRequest::new("gemini-2.5-flash", vec![ChatMessage::user("Explain how AI works")])
            .with_system_prompt("You are a cat.")
    }

    #[test]
    fn test_build_request_shape() {
        let provider = GeminiProvider::new("g");
        let req = request().with_max_tokens(2048).with_temperature(0.5);
        let body = serde_json::to_value(provider.build_request(&req)).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "You are a cat.");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "Explain how AI works");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
        assert!(body["generationConfig"].get("thinkingConfig").is_none());
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_thinking_budget() {
        let provider = GeminiProvider::new("g");
        let req = request().with_max_tokens(10_000).with_thinking(ThinkingLevel::Medium);
        let body = serde_json::to_value(provider.build_request(&req)).unwrap();
        assert_eq!(body["generationConfig"]["thinkingConfig"]["thinkingBudget"], 8192);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 10_000);
    }

    #[test]
    fn test_function_response_takes_name_from_prior_call() {
        let call = ToolCall::from_json_arguments("call_a", "get_weather", r#"{"city":"Rome"}"#);
        let messages = vec![
            ChatMessage::user("weather?"),
            ChatMessage::assistant_with_tools("", &[call]),
            ChatMessage::tool_result("call_a", "sunny", false),
        ];
        let mut system = Vec::new();
        let contents = GeminiProvider::convert_contents(&messages, &mut system);
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1].role.as_deref(), Some("model"));
        let response = contents[2].parts[0].function_response.as_ref().unwrap();
        assert_eq!(response.name, "get_weather");
        assert_eq!(response.response, json!({"content": "sunny"}));
    }

    #[test]
    fn test_parse_documented_response() {
        // Example response from the generateContent reference.
        let raw = json!({
            "candidates": [{
                "content": {
                    "parts": [{"text": "AI learns patterns from data."}],
                    "role": "model"
                },
                "finishReason": "STOP",
                "index": 0
            }],
            "usageMetadata": {
                "promptTokenCount": 4,
                "candidatesTokenCount": 7,
                "totalTokenCount": 11
            },
            "modelVersion": "gemini-2.5-flash",
            "responseId": "resp-123"
        });
        let provider = GeminiProvider::new("g");
        let parsed: GenerateContentResponse = serde_json::from_value(raw).unwrap();
        let response = provider.parse_response(parsed, &request()).unwrap();
        assert_eq!(response.id, "resp-123");
        assert_eq!(response.content, "AI learns patterns from data.");
        assert_eq!(response.usage, TokenUsage::with_total(4, 7, 11));
        assert_eq!(response.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_parse_skips_thoughts_and_reads_first_candidate() {
        let raw = json!({
            "candidates": [
                {
                    "content": {"role": "model", "parts": [
                        {"text": "planning...", "thought": true},
                        {"functionCall": {"name": "get_weather", "args": {"city": "Rome"}}}
                    ]},
                    "finishReason": "STOP"
                },
                {"content": {"role": "model", "parts": [{"text": "second"}]}, "finishReason": "STOP"}
            ]
        });
        let provider = GeminiProvider::new("g");
        let parsed: GenerateContentResponse = serde_json::from_value(raw).unwrap();
        let response = provider.parse_response(parsed, &request()).unwrap();
        assert_eq!(response.content, "");
        assert_eq!(response.tool_calls[0].name, "get_weather");
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
    }

    #[test]
    fn test_no_candidates_is_malformed() {
        let provider = GeminiProvider::new("g");
        let parsed: GenerateContentResponse =
            serde_json::from_value(json!({"promptFeedback": {"blockReason": "SAFETY"}})).unwrap();
        let err = provider.parse_response(parsed, &request()).unwrap_err();
        assert!(matches!(err, LlmError::MalformedResponse { .. }));
    }

    #[test]
    fn test_mapper_chunks() {
        let mut mapper = GeminiMapper::new("gemini-2.5-flash");
        let first = mapper.map(
            &json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "Hel"}]}}], "responseId": "r1"}),
            None,
        );
        assert_eq!(first.len(), 2);
        assert!(matches!(&first[0], StreamEvent::MessageStart { message_id, .. } if message_id == "r1"));
        assert_eq!(first[1], StreamEvent::token("Hel"));

        let last = mapper.map(
            &json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "lo"}]}, "finishReason": "MAX_TOKENS"}],
                "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 3}
            }),
            None,
        );
        assert_eq!(
            last,
            vec![
                StreamEvent::token("lo"),
                StreamEvent::done(TokenUsage::new(2, 3), FinishReason::Length)
            ]
        );
    }

    #[test]
    fn test_mapper_estimates_missing_usage_metadata() {
        let mut mapper = GeminiMapper::for_request("m", &request());
        mapper.map(&json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "Purr"}]}}]}), None);
        let last = mapper.map(&json!({"candidates": [{"finishReason": "STOP"}]}), None);
        assert_eq!(
            last,
            vec![StreamEvent::done(
                TokenUsage::new(usage::estimate_request_tokens(&request()), usage::estimate_tokens("Purr")),
                FinishReason::Stop
            )]
        );
    }

    #[test]
    fn test_mapper_in_band_error() {
        let mut mapper = GeminiMapper::new("m");
        let events = mapper.map(
            &json!({"error": {"code": 429, "message": "Resource has been exhausted", "status": "RESOURCE_EXHAUSTED"}}),
            None,
        );
        assert_eq!(
            events,
            vec![StreamEvent::error(StreamErrorKind::Provider, "Resource has been exhausted")]
        );
    }

    #[tokio::test]
    async fn test_chat_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash:generateContent"))
            .and(header("x-goog-api-key", "g-key"))
            .and(body_partial_json(json!({"systemInstruction": {"parts": [{"text": "You are a cat."}]}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "Meow"}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 1, "totalTokenCount": 6}
            })))
            .mount(&server)
            .await;

        let provider = GeminiProvider::new("g-key").with_base_url(server.uri());
        let response = provider.chat(&request()).await.unwrap();
        assert_eq!(response.content, "Meow");
        assert_eq!(response.model, "gemini-2.5-flash");
    }

    #[tokio::test]
    async fn test_stream_against_mock_server() {
        let body = concat!(
            "data: {\"candidates\": [{\"content\": {\"parts\": [{\"text\": \"Purr\"}],\"role\": \"model\"},\"index\": 0}],\"modelVersion\": \"gemini-2.5-flash\"}\r\n\r\n",
            "data: {\"candidates\": [{\"content\": {\"parts\": [{\"text\": \"!\"}],\"role\": \"model\"},\"finishReason\": \"STOP\",\"index\": 0}],\"usageMetadata\": {\"promptTokenCount\": 5,\"candidatesTokenCount\": 2,\"totalTokenCount\": 7},\"modelVersion\": \"gemini-2.5-flash\"}\r\n\r\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let provider = GeminiProvider::new("g").with_base_url(server.uri());
        let events: Vec<StreamEvent> = provider
            .stream(&request(), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(events.len(), 4);
        assert_eq!(events[1], StreamEvent::token("Purr"));
        assert_eq!(events[2], StreamEvent::token("!"));
        assert_eq!(
            events[3],
            StreamEvent::done(TokenUsage::with_total(5, 2, 7), FinishReason::Stop)
        );
    }

    #[tokio::test]
    async fn test_list_models_uses_reported_limits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1beta/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [
                    {
                        "name": "models/gemini-2.5-pro",
                        "displayName": "Gemini 2.5 Pro",
                        "inputTokenLimit": 1048576,
                        "outputTokenLimit": 65536,
                        "supportedGenerationMethods": ["generateContent", "countTokens"]
                    },
                    {
                        "name": "models/text-embedding-004",
                        "inputTokenLimit": 2048,
                        "supportedGenerationMethods": ["embedContent"]
                    }
                ]
            })))
            .mount(&server)
            .await;

        let provider = GeminiProvider::new("g").with_base_url(server.uri());
        let models = provider.list_models().await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "gemini-2.5-pro");
        assert_eq!(models[0].context_window, 1_048_576);
        assert_eq!(models[0].max_output_tokens, Some(65_536));
    }
}
