//! Canonical request, response and streaming types shared by every backend.
//!
//! Adapters translate *into* these shapes; nothing above the provider layer
//! ever sees a vendor payload.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Messages
// ============================================================================

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    /// Get the role as a string slice.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

/// One block of structured message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// A tool invocation issued by the assistant.
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Map<String, Value>,
    },
    /// The outcome of a tool invocation, fed back to the model.
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

/// Message body: plain text or an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenation of every text block, in order.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// View the content as blocks, wrapping plain text in a single text block.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub content: MessageContent,

    /// Correlates a `tool` message with the invocation it answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a message with a fresh id and the current timestamp.
    pub fn new(role: ChatRole, content: impl Into<MessageContent>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content.into())
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content.into())
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content.into())
    }

    /// Create an assistant message carrying tool invocations after optional text.
    pub fn assistant_with_tools(content: impl Into<String>, calls: &[ToolCall]) -> Self {
        let content = content.into();
        let mut blocks = Vec::with_capacity(calls.len() + 1);
        if !content.is_empty() {
            blocks.push(ContentBlock::Text { text: content });
        }
        blocks.extend(calls.iter().map(|c| ContentBlock::ToolUse {
            id: c.id.clone(),
            name: c.name.clone(),
            input: c.arguments.clone(),
        }));
        Self::new(ChatRole::Assistant, MessageContent::Blocks(blocks))
    }

    /// Create a tool-result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        let tool_call_id = tool_call_id.into();
        let mut msg = Self::new(
            ChatRole::Tool,
            MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: tool_call_id.clone(),
                content: content.into(),
                is_error,
            }]),
        );
        msg.tool_call_id = Some(tool_call_id);
        msg
    }

    /// Text content of this message.
    pub fn text(&self) -> String {
        self.content.text()
    }
}

// ============================================================================
// Tools
// ============================================================================

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a tool definition.
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A structured tool invocation extracted from a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    /// Build a tool call from a JSON-encoded argument string.
    ///
    /// Unparsable or non-object arguments degrade to an empty map.
    pub fn from_json_arguments(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: &str,
    ) -> Self {
        let name = name.into();
        let arguments = if arguments.trim().is_empty() {
            Map::new()
        } else {
            match serde_json::from_str::<Value>(arguments) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    tracing::warn!(tool = %name, "tool arguments are not a JSON object; using empty map");
                    Map::new()
                }
            }
        };
        Self {
            id: id.into(),
            name,
            arguments,
        }
    }

    /// Build a tool call from an already-decoded value; non-objects become an empty map.
    pub fn from_value_arguments(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: &Value,
    ) -> Self {
        match arguments {
            Value::Object(map) => Self {
                id: id.into(),
                name: name.into(),
                arguments: map.clone(),
            },
            Value::String(s) => Self::from_json_arguments(id, name, s),
            _ => Self {
                id: id.into(),
                name: name.into(),
                arguments: Map::new(),
            },
        }
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

/// Coarse reasoning effort requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
        }
    }
}

/// A canonical chat request. Adapters only read it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Target model id; empty means the adapter's default model.
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingLevel>,
}

impl ChatRequest {
    /// Create a request for `model` with the given messages.
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_thinking(mut self, level: ThinkingLevel) -> Self {
        self.thinking = Some(level);
        self
    }

    /// The requested model, or `fallback` when none was given.
    pub fn model_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.model.is_empty() {
            fallback
        } else {
            &self.model
        }
    }
}

/// Canonical reason a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    ToolUse,
    Length,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolUse => "tool_use",
            FinishReason::Length => "length",
            FinishReason::Error => "error",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FinishReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(FinishReason::Stop),
            "tool_use" => Ok(FinishReason::ToolUse),
            "length" => Ok(FinishReason::Length),
            "error" => Ok(FinishReason::Error),
            other => Err(format!("unknown finish reason '{}'", other)),
        }
    }
}

/// Token accounting for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Usage with total computed as the sum of input and output.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Usage with a vendor-reported total.
    pub fn with_total(input_tokens: u64, output_tokens: u64, total_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }
}

/// A complete (non-streaming) chat response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    /// Model that actually served the request.
    pub model: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ============================================================================
// Streaming
// ============================================================================

/// Classification of a streamed failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    /// Connect or read failure.
    Transport,
    /// Non-2xx HTTP status.
    Http,
    /// A frame carried unparsable JSON.
    Parse,
    /// A frame parsed but did not have a recognizable shape.
    Protocol,
    /// The body ended in the middle of a frame.
    IncompleteFrame,
    /// The backend reported an error in-band.
    Provider,
}

/// Cause carried by an `error` stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl StreamError {
    pub fn new(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }
}

impl From<&crate::error::LlmError> for StreamError {
    fn from(err: &crate::error::LlmError) -> Self {
        use crate::error::LlmError;
        let kind = match err {
            LlmError::Http { .. } => StreamErrorKind::Http,
            LlmError::MalformedResponse { .. } | LlmError::SerializationError(_) => {
                StreamErrorKind::Protocol
            }
            _ => StreamErrorKind::Transport,
        };
        Self {
            kind,
            message: err.to_string(),
            status: err.status(),
        }
    }
}

/// Canonical streaming event.
///
/// Every stream ends with exactly one `Done`. A failure is reported as
/// `Error` followed immediately by a zero-usage `Done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    MessageStart {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Token {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallStart {
        tool_call: ToolCall,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallEnd {
        call_id: String,
        name: String,
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Compaction {
        summary: String,
        tokens_before: u64,
        tokens_after: u64,
    },
    Error {
        error: StreamError,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        usage: TokenUsage,
        finish_reason: FinishReason,
    },
}

impl StreamEvent {
    pub fn token(content: impl Into<String>) -> Self {
        StreamEvent::Token {
            content: content.into(),
        }
    }

    pub fn error(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: StreamError::new(kind, message),
        }
    }

    pub fn done(usage: TokenUsage, finish_reason: FinishReason) -> Self {
        StreamEvent::Done {
            usage,
            finish_reason,
        }
    }

    /// The `done` emitted for the `[DONE]` sentinel and after a terminal error.
    pub fn synthetic_done() -> Self {
        Self::done(TokenUsage::zero(), FinishReason::Stop)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done { .. })
    }
}

// ============================================================================
// Models and provider identity
// ============================================================================

/// Capability a model advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCapability {
    Chat,
    Streaming,
    ToolUse,
    Vision,
    Audio,
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub display_name: String,
    /// Owning provider id, e.g. `"anthropic"`.
    pub provider: String,
    pub context_window: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    pub capabilities: Vec<ModelCapability>,
}

impl Model {
    pub fn supports(&self, capability: ModelCapability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// How a backend authenticates requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// A key in a vendor-specific header.
    ApiKeyHeader,
    /// `Authorization: Bearer <key>`.
    Bearer,
    /// No credential, reached over a local base URL.
    None,
}

/// Streaming wire framing declared by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    #[default]
    Sse,
    Ndjson,
    ChunkedText,
}

/// Static identity of an adapter, fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderCapabilities {
    pub id: &'static str,
    pub display_name: &'static str,
    pub auth_modes: Vec<AuthMode>,
    pub framing: Framing,
    pub local: bool,
    pub supports_thinking: bool,
    pub supports_tools: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_event_wire_shape() {
        let event = StreamEvent::done(TokenUsage::new(3, 4), FinishReason::ToolUse);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "done",
                "usage": {"inputTokens": 3, "outputTokens": 4, "totalTokens": 7},
                "finishReason": "tool_use"
            })
        );

        let start = StreamEvent::MessageStart {
            message_id: "m1".into(),
            conversation_id: None,
            model: Some("gpt".into()),
        };
        let value = serde_json::to_value(&start).unwrap();
        assert_eq!(value["messageId"], "m1");
        assert!(value.get("conversationId").is_none());
    }

    #[test]
    fn test_token_usage_sums_total() {
        let usage = TokenUsage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(TokenUsage::with_total(10, 5, 20).total_tokens, 20);
    }

    #[test]
    fn test_tool_call_bad_arguments_degrade_to_empty_map() {
        let call = ToolCall::from_json_arguments("c1", "search", "{not json");
        assert!(call.arguments.is_empty());

        let call = ToolCall::from_json_arguments("c1", "search", r#"["array"]"#);
        assert!(call.arguments.is_empty());

        let call = ToolCall::from_json_arguments("c1", "search", r#"{"q":"rust"}"#);
        assert_eq!(call.arguments["q"], "rust");
    }

    #[test]
    fn test_message_content_text_concatenates_blocks() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::Text { text: "a".into() },
            ContentBlock::ToolUse {
                id: "t".into(),
                name: "n".into(),
                input: Map::new(),
            },
            ContentBlock::Text { text: "b".into() },
        ]);
        assert_eq!(content.text(), "ab");
    }

    #[test]
    fn test_tool_result_message_sets_correlation_id() {
        let msg = ChatMessage::tool_result("call_9", "42", true);
        assert_eq!(msg.role, ChatRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_9"));
        match &msg.content {
            MessageContent::Blocks(blocks) => assert!(matches!(
                &blocks[0],
                ContentBlock::ToolResult { is_error: true, .. }
            )),
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn test_request_model_fallback() {
        let req = ChatRequest::new("", vec![ChatMessage::user("hi")]);
        assert_eq!(req.model_or("llama3"), "llama3");
        let req = ChatRequest::new("qwen", vec![]);
        assert_eq!(req.model_or("llama3"), "qwen");
    }

    #[test]
    fn test_finish_reason_parse() {
        assert_eq!("tool_use".parse::<FinishReason>().unwrap(), FinishReason::ToolUse);
        assert!("end_turn".parse::<FinishReason>().is_err());
    }
}
