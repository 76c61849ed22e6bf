//! Event normalization: decoded JSON payloads to canonical [`StreamEvent`]s.
//!
//! Recognized shapes, in dispatch order:
//!
//! 1. The internal shape (`token`, `message_start`, `tool_call_start`,
//!    `tool_call_end`, `compaction`, `error`, `done`).
//! 2. Anthropic Messages events (`message_start`, `content_block_*`,
//!    `message_delta`, `message_stop`, `ping`).
//! 3. OpenAI Responses events (`response.*`).
//! 4. OpenAI-compatible chat chunks (`choices[0].delta`), used when the
//!    payload carries no recognizable `type`.
//!
//! Block-boundary and keep-alive frames map to zero events. That path is
//! separate from the error path: a recognized frame with malformed fields
//! produces exactly one `error` event, never a partially filled one.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::warn;

use crate::finish_reason;
use crate::types::{ChatRequest, FinishReason, StreamErrorKind, StreamEvent, TokenUsage, ToolCall};
use crate::usage;

/// Maps one decoded payload to zero or more events.
///
/// Implementations may keep per-stream state, e.g. to assemble tool-call
/// arguments that arrive in fragments. A fresh mapper is used per stream.
pub trait PayloadMapper: Send {
    fn map(&mut self, payload: &Value, event: Option<&str>) -> Vec<StreamEvent>;

    /// Called at `[DONE]` or a clean end of body. Returns a `done` the mapper
    /// held back, if any; otherwise the stream gets a synthetic one.
    fn finish(&mut self) -> Option<StreamEvent> {
        None
    }
}

/// Outcome of matching one payload against the known shapes.
#[derive(Debug)]
enum Dispatch {
    Events(Vec<StreamEvent>),
    /// A known no-op frame.
    Ignored,
    /// Known type, unusable fields.
    Malformed(String),
    /// Type string matched nothing.
    Unrecognized,
}

impl From<Result<Vec<StreamEvent>, String>> for Dispatch {
    fn from(result: Result<Vec<StreamEvent>, String>) -> Self {
        match result {
            Ok(events) if events.is_empty() => Dispatch::Ignored,
            Ok(events) => Dispatch::Events(events),
            Err(reason) => Dispatch::Malformed(reason),
        }
    }
}

#[derive(Debug, Default)]
struct PendingTool {
    id: String,
    name: String,
    arguments: String,
    initial: Option<Value>,
}

impl PendingTool {
    fn into_call(self) -> ToolCall {
        if self.arguments.trim().is_empty() {
            match self.initial {
                Some(initial) => ToolCall::from_value_arguments(self.id, self.name, &initial),
                None => ToolCall::from_json_arguments(self.id, self.name, ""),
            }
        } else {
            ToolCall::from_json_arguments(self.id, self.name, &self.arguments)
        }
    }
}

/// Stateful normalizer for one stream.
#[derive(Debug, Default)]
pub struct EventNormalizer {
    /// Tool blocks being assembled, keyed by content index.
    pending_tools: BTreeMap<u64, PendingTool>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    stop_reason: Option<FinishReason>,
    emitted_tool_calls: bool,
    /// Prompt size estimate; when set, counts a vendor leaves out are estimated.
    prompt_estimate: Option<u64>,
    output_text: String,
    /// Chat finish seen without usage; the usage may follow in a trailer chunk.
    held_finish: Option<FinishReason>,
}

impl PayloadMapper for EventNormalizer {
    fn map(&mut self, payload: &Value, event: Option<&str>) -> Vec<StreamEvent> {
        self.normalize(payload, event)
    }

    fn finish(&mut self) -> Option<StreamEvent> {
        let finish = self.held_finish.take()?;
        Some(StreamEvent::done(self.finish_usage(None, None, None), finish))
    }
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A normalizer that estimates usage for `request` when the backend
    /// reports none: the prompt from the request, the output from the
    /// streamed text.
    pub fn for_request(request: &ChatRequest) -> Self {
        Self {
            prompt_estimate: Some(usage::estimate_request_tokens(request)),
            ..Self::default()
        }
    }

    /// Map one payload. `event` is the latest SSE `event:` name, consulted
    /// only when the payload has no `type` field.
    pub fn normalize(&mut self, payload: &Value, event: Option<&str>) -> Vec<StreamEvent> {
        let events = self.map_payload(payload, event);
        for mapped in &events {
            if let StreamEvent::Token { content } = mapped {
                self.output_text.push_str(content);
            }
        }
        events
    }

    /// Usage for a vendor `done`, estimating missing counts when configured.
    fn finish_usage(&self, input: Option<u64>, output: Option<u64>, total: Option<u64>) -> TokenUsage {
        match self.prompt_estimate {
            Some(prompt) => usage::fill_missing(input, output, total, prompt, &self.output_text),
            None => {
                let (input, output) = (input.unwrap_or(0), output.unwrap_or(0));
                match total {
                    Some(total) => TokenUsage::with_total(input, output, total),
                    None => TokenUsage::new(input, output),
                }
            }
        }
    }

    fn map_payload(&mut self, payload: &Value, event: Option<&str>) -> Vec<StreamEvent> {
        let explicit = match payload.get("type") {
            Some(Value::String(t)) => Some(t.as_str()),
            Some(other) => {
                return vec![protocol_error(format!(
                    "`type` discriminator must be a string, got {}",
                    other
                ))]
            }
            None => None,
        };

        if let Some(kind) = explicit.or(event) {
            match self.dispatch(kind, payload) {
                Dispatch::Events(events) => return events,
                Dispatch::Ignored => return Vec::new(),
                Dispatch::Malformed(reason) => {
                    return vec![protocol_error(format!("malformed `{}` event: {}", kind, reason))]
                }
                Dispatch::Unrecognized => {}
            }
        }

        if payload.get("choices").is_some() {
            return match self.choices_delta(payload) {
                Ok(events) => events,
                Err(reason) => vec![protocol_error(format!("malformed chat chunk: {}", reason))],
            };
        }

        match explicit {
            Some(kind) => vec![protocol_error(format!("unrecognized event type `{}`", kind))],
            None => vec![protocol_error(
                "payload has neither a recognizable `type` nor `choices`",
            )],
        }
    }

    fn dispatch(&mut self, kind: &str, p: &Value) -> Dispatch {
        match kind {
            // Internal shape (message_start is shared with Anthropic)
            "message_start" => self.message_start(p).into(),
            "token" => token(p).into(),
            "tool_call_start" => self.tool_call_start(p).into(),
            "tool_call_end" => tool_call_end(p).into(),
            "compaction" => compaction(p).into(),
            "error" => in_band_error(p).into(),
            "done" => done(p).into(),

            // Anthropic Messages
            "content_block_start" => self.content_block_start(p).into(),
            "content_block_delta" => self.content_block_delta(p).into(),
            "content_block_stop" => self.content_block_stop(p).into(),
            "message_delta" => self.message_delta(p).into(),
            "message_stop" => Dispatch::Events(vec![self.anthropic_done()]),

            // OpenAI Responses
            "response.created" => response_created(p).into(),
            "response.output_text.delta" => text_delta(p, "delta").into(),
            "response.output_item.done" => self.output_item_done(p).into(),
            "response.completed" | "response.incomplete" => self.response_finished(p).into(),
            "response.failed" => response_failed(p).into(),

            "ping"
            | "keepalive"
            | "response.queued"
            | "response.in_progress"
            | "response.output_item.added"
            | "response.content_part.added"
            | "response.content_part.done"
            | "response.output_text.done"
            | "response.output_text.annotation.added"
            | "response.function_call_arguments.delta"
            | "response.function_call_arguments.done"
            | "response.reasoning_summary_part.added"
            | "response.reasoning_summary_part.done"
            | "response.reasoning_summary_text.delta"
            | "response.reasoning_summary_text.done" => Dispatch::Ignored,

            _ => Dispatch::Unrecognized,
        }
    }

    // ------------------------------------------------------------------------
    // Shared / internal shape
    // ------------------------------------------------------------------------

    fn message_start(&mut self, p: &Value) -> Result<Vec<StreamEvent>, String> {
        // Anthropic nests the message object.
        if let Some(message) = p.get("message") {
            let message = message.as_object().ok_or("`message` is not an object")?;
            let id = str_field(message, "id")?;
            if let Some(tokens) = message
                .get("usage")
                .and_then(|u| u.get("input_tokens"))
                .and_then(Value::as_u64)
            {
                self.input_tokens = Some(tokens);
            }
            return Ok(vec![StreamEvent::MessageStart {
                message_id: id.to_string(),
                conversation_id: None,
                model: opt_str_field(message, "model")?.map(str::to_string),
            }]);
        }

        let obj = as_object(p)?;
        Ok(vec![StreamEvent::MessageStart {
            message_id: str_field(obj, "messageId")?.to_string(),
            conversation_id: opt_str_field(obj, "conversationId")?.map(str::to_string),
            model: opt_str_field(obj, "model")?.map(str::to_string),
        }])
    }

    fn tool_call_start(&mut self, p: &Value) -> Result<Vec<StreamEvent>, String> {
        let call = as_object(p)?
            .get("toolCall")
            .and_then(Value::as_object)
            .ok_or("missing `toolCall` object")?;
        let id = str_field(call, "id")?;
        let name = str_field(call, "name")?;
        let tool_call = match call.get("arguments") {
            None | Some(Value::Null) => ToolCall::from_json_arguments(id, name, ""),
            Some(args @ (Value::Object(_) | Value::String(_))) => {
                ToolCall::from_value_arguments(id, name, args)
            }
            Some(_) => return Err("`arguments` must be an object or a JSON string".into()),
        };
        self.emitted_tool_calls = true;
        Ok(vec![StreamEvent::ToolCallStart { tool_call }])
    }

    // ------------------------------------------------------------------------
    // Anthropic Messages
    // ------------------------------------------------------------------------

    fn content_block_start(&mut self, p: &Value) -> Result<Vec<StreamEvent>, String> {
        let obj = as_object(p)?;
        let index = obj.get("index").and_then(Value::as_u64).unwrap_or(0);
        let block = obj
            .get("content_block")
            .and_then(Value::as_object)
            .ok_or("missing `content_block` object")?;
        if block.get("type").and_then(Value::as_str) == Some("tool_use") {
            self.pending_tools.insert(
                index,
                PendingTool {
                    id: str_field(block, "id")?.to_string(),
                    name: str_field(block, "name")?.to_string(),
                    arguments: String::new(),
                    initial: block.get("input").cloned(),
                },
            );
        }
        Ok(Vec::new())
    }

    fn content_block_delta(&mut self, p: &Value) -> Result<Vec<StreamEvent>, String> {
        let obj = as_object(p)?;
        let Some(delta) = obj.get("delta") else {
            return Ok(Vec::new());
        };
        let delta = delta.as_object().ok_or("`delta` is not an object")?;
        match delta.get("type").and_then(Value::as_str) {
            Some("input_json_delta") => {
                let index = obj.get("index").and_then(Value::as_u64).unwrap_or(0);
                let fragment = opt_str_field(delta, "partial_json")?.unwrap_or_default();
                match self.pending_tools.get_mut(&index) {
                    Some(tool) => tool.arguments.push_str(fragment),
                    None => warn!(index, "input_json_delta for unknown content block"),
                }
                Ok(Vec::new())
            }
            Some("thinking_delta") | Some("signature_delta") | Some("citations_delta") => {
                Ok(Vec::new())
            }
            _ => match opt_str_field(delta, "text")? {
                Some(text) if !text.is_empty() => Ok(vec![StreamEvent::token(text)]),
                _ => Ok(Vec::new()),
            },
        }
    }

    fn content_block_stop(&mut self, p: &Value) -> Result<Vec<StreamEvent>, String> {
        let index = as_object(p)?
            .get("index")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        match self.pending_tools.remove(&index) {
            Some(tool) => {
                self.emitted_tool_calls = true;
                Ok(vec![StreamEvent::ToolCallStart {
                    tool_call: tool.into_call(),
                }])
            }
            None => Ok(Vec::new()),
        }
    }

    fn message_delta(&mut self, p: &Value) -> Result<Vec<StreamEvent>, String> {
        let obj = as_object(p)?;
        if let Some(delta) = obj.get("delta").and_then(Value::as_object) {
            if let Some(reason) = opt_str_field(delta, "stop_reason")? {
                self.stop_reason = Some(finish_reason::from_anthropic(reason));
            }
        }
        if let Some(usage) = obj.get("usage").and_then(Value::as_object) {
            if let Some(out) = usage.get("output_tokens").and_then(Value::as_u64) {
                self.output_tokens = Some(out);
            }
            if let Some(input) = usage.get("input_tokens").and_then(Value::as_u64) {
                self.input_tokens = Some(input);
            }
        }
        Ok(Vec::new())
    }

    fn anthropic_done(&mut self) -> StreamEvent {
        let finish = self.stop_reason.unwrap_or(if self.emitted_tool_calls {
            FinishReason::ToolUse
        } else {
            FinishReason::Stop
        });
        StreamEvent::done(
            self.finish_usage(self.input_tokens, self.output_tokens, None),
            finish,
        )
    }

    // ------------------------------------------------------------------------
    // OpenAI Responses
    // ------------------------------------------------------------------------

    fn output_item_done(&mut self, p: &Value) -> Result<Vec<StreamEvent>, String> {
        let item = as_object(p)?
            .get("item")
            .and_then(Value::as_object)
            .ok_or("missing `item` object")?;
        if item.get("type").and_then(Value::as_str) != Some("function_call") {
            return Ok(Vec::new());
        }
        let id = match opt_str_field(item, "call_id")? {
            Some(id) => id,
            None => str_field(item, "id")?,
        };
        let name = str_field(item, "name")?;
        let args = opt_str_field(item, "arguments")?.unwrap_or_default();
        self.emitted_tool_calls = true;
        Ok(vec![StreamEvent::ToolCallStart {
            tool_call: ToolCall::from_json_arguments(id, name, args),
        }])
    }

    fn response_finished(&mut self, p: &Value) -> Result<Vec<StreamEvent>, String> {
        let response = as_object(p)?
            .get("response")
            .and_then(Value::as_object)
            .ok_or("missing `response` object")?;
        let status = opt_str_field(response, "status")?.unwrap_or("completed");
        let incomplete_reason = response
            .get("incomplete_details")
            .and_then(|d| d.get("reason"))
            .and_then(Value::as_str);
        let (input, output, total) = usage_counts(
            response.get("usage").and_then(Value::as_object),
            "input_tokens",
            "output_tokens",
        );
        let usage = self.finish_usage(input, output, total);
        Ok(vec![StreamEvent::done(
            usage,
            finish_reason::from_responses_status(status, incomplete_reason, self.emitted_tool_calls),
        )])
    }

    // ------------------------------------------------------------------------
    // OpenAI-compatible chat chunks
    // ------------------------------------------------------------------------

    fn choices_delta(&mut self, p: &Value) -> Result<Vec<StreamEvent>, String> {
        let choices = p
            .get("choices")
            .and_then(Value::as_array)
            .ok_or("`choices` is not an array")?;
        let usage = p.get("usage").and_then(Value::as_object);
        // Usage-only trailer chunks carry an empty choices array.
        let Some(choice) = choices.first() else {
            if usage.is_some() {
                if let Some(finish) = self.held_finish.take() {
                    return Ok(vec![self.chat_done(usage, finish)]);
                }
            }
            return Ok(Vec::new());
        };
        let choice = choice.as_object().ok_or("`choices[0]` is not an object")?;

        let mut events = Vec::new();
        if let Some(delta) = choice.get("delta") {
            let delta = delta.as_object().ok_or("`delta` is not an object")?;
            if let Some(text) = opt_str_field(delta, "content")? {
                if !text.is_empty() {
                    events.push(StreamEvent::token(text));
                }
            }
            if let Some(calls) = delta.get("tool_calls") {
                let calls = calls.as_array().ok_or("`tool_calls` is not an array")?;
                for (position, call) in calls.iter().enumerate() {
                    self.accumulate_chat_tool(position as u64, call)?;
                }
            }
        }

        if let Some(reason) = opt_str_field(choice, "finish_reason")? {
            for tool in std::mem::take(&mut self.pending_tools).into_values() {
                self.emitted_tool_calls = true;
                events.push(StreamEvent::ToolCallStart {
                    tool_call: tool.into_call(),
                });
            }
            let mut finish = finish_reason::from_openai_compatible(reason);
            if finish == FinishReason::Stop && self.emitted_tool_calls {
                finish = FinishReason::ToolUse;
            }
            if usage.is_some() {
                events.push(self.chat_done(usage, finish));
            } else {
                self.held_finish = Some(finish);
            }
        }
        Ok(events)
    }

    fn chat_done(&self, usage: Option<&Map<String, Value>>, finish: FinishReason) -> StreamEvent {
        let (input, output, total) = usage_counts(usage, "prompt_tokens", "completion_tokens");
        StreamEvent::done(self.finish_usage(input, output, total), finish)
    }

    fn accumulate_chat_tool(&mut self, position: u64, call: &Value) -> Result<(), String> {
        let call = call.as_object().ok_or("tool call delta is not an object")?;
        let index = call.get("index").and_then(Value::as_u64).unwrap_or(position);
        let entry = self.pending_tools.entry(index).or_default();
        if let Some(id) = opt_str_field(call, "id")? {
            entry.id = id.to_string();
        }
        if let Some(function) = call.get("function").and_then(Value::as_object) {
            if let Some(name) = opt_str_field(function, "name")? {
                entry.name.push_str(name);
            }
            if let Some(args) = opt_str_field(function, "arguments")? {
                entry.arguments.push_str(args);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Stateless shape handlers
// ============================================================================

fn token(p: &Value) -> Result<Vec<StreamEvent>, String> {
    let content = str_field(as_object(p)?, "content")?;
    Ok(vec![StreamEvent::token(content)])
}

fn text_delta(p: &Value, field: &str) -> Result<Vec<StreamEvent>, String> {
    match opt_str_field(as_object(p)?, field)? {
        Some(text) if !text.is_empty() => Ok(vec![StreamEvent::token(text)]),
        _ => Ok(Vec::new()),
    }
}

fn tool_call_end(p: &Value) -> Result<Vec<StreamEvent>, String> {
    let obj = as_object(p)?;
    Ok(vec![StreamEvent::ToolCallEnd {
        call_id: str_field(obj, "callId")?.to_string(),
        name: str_field(obj, "name")?.to_string(),
        result: obj.get("result").cloned().unwrap_or(Value::Null),
        error: opt_str_field(obj, "error")?.map(str::to_string),
    }])
}

fn compaction(p: &Value) -> Result<Vec<StreamEvent>, String> {
    let obj = as_object(p)?;
    Ok(vec![StreamEvent::Compaction {
        summary: str_field(obj, "summary")?.to_string(),
        tokens_before: u64_field(obj, "tokensBefore")?,
        tokens_after: u64_field(obj, "tokensAfter")?,
    }])
}

fn in_band_error(p: &Value) -> Result<Vec<StreamEvent>, String> {
    let obj = as_object(p)?;
    let message = match obj.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(inner)) => match inner.get("message").and_then(Value::as_str) {
            Some(m) => m.to_string(),
            None => Value::Object(inner.clone()).to_string(),
        },
        _ => str_field(obj, "message")?.to_string(),
    };
    Ok(vec![StreamEvent::error(StreamErrorKind::Provider, message)])
}

fn done(p: &Value) -> Result<Vec<StreamEvent>, String> {
    let obj = as_object(p)?;
    let usage = match obj.get("usage") {
        None | Some(Value::Null) => TokenUsage::zero(),
        Some(Value::Object(u)) => {
            let input = opt_u64_field(u, "inputTokens")?.unwrap_or(0);
            let output = opt_u64_field(u, "outputTokens")?.unwrap_or(0);
            match opt_u64_field(u, "totalTokens")? {
                Some(total) => TokenUsage::with_total(input, output, total),
                None => TokenUsage::new(input, output),
            }
        }
        Some(_) => return Err("`usage` is not an object".into()),
    };
    let finish = match opt_str_field(obj, "finishReason")? {
        Some(reason) => reason.parse::<FinishReason>()?,
        None => FinishReason::Stop,
    };
    Ok(vec![StreamEvent::done(usage, finish)])
}

fn response_created(p: &Value) -> Result<Vec<StreamEvent>, String> {
    let response = as_object(p)?
        .get("response")
        .and_then(Value::as_object)
        .ok_or("missing `response` object")?;
    Ok(vec![StreamEvent::MessageStart {
        message_id: str_field(response, "id")?.to_string(),
        conversation_id: None,
        model: opt_str_field(response, "model")?.map(str::to_string),
    }])
}

fn response_failed(p: &Value) -> Result<Vec<StreamEvent>, String> {
    let message = p
        .get("response")
        .and_then(|r| r.get("error"))
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("response failed");
    Ok(vec![StreamEvent::error(StreamErrorKind::Provider, message)])
}

/// Reported `(input, output, total)` counts, each `None` when absent.
fn usage_counts(
    u: Option<&Map<String, Value>>,
    input_field: &str,
    output_field: &str,
) -> (Option<u64>, Option<u64>, Option<u64>) {
    let Some(u) = u else {
        return (None, None, None);
    };
    let count = |field: &str| u.get(field).and_then(Value::as_u64);
    (count(input_field), count(output_field), count("total_tokens"))
}

fn protocol_error(message: impl Into<String>) -> StreamEvent {
    let message = message.into();
    warn!(error = %message, "dropping unusable stream payload");
    StreamEvent::error(StreamErrorKind::Protocol, message)
}

// ============================================================================
// Field access helpers
// ============================================================================

fn as_object(p: &Value) -> Result<&Map<String, Value>, String> {
    p.as_object()
        .ok_or_else(|| "payload is not a JSON object".to_string())
}

fn str_field<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a str, String> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(format!("`{}` must be a string, got {}", field, other)),
        None => Err(format!("missing `{}`", field)),
    }
}

fn opt_str_field<'a>(
    obj: &'a Map<String, Value>,
    field: &str,
) -> Result<Option<&'a str>, String> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(format!("`{}` must be a string, got {}", field, other)),
    }
}

fn u64_field(obj: &Map<String, Value>, field: &str) -> Result<u64, String> {
    opt_u64_field(obj, field)?.ok_or_else(|| format!("missing `{}`", field))
}

fn opt_u64_field(obj: &Map<String, Value>, field: &str) -> Result<Option<u64>, String> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("`{}` must be a non-negative integer, got {}", field, v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn one(payload: Value) -> Vec<StreamEvent> {
        EventNormalizer::new().normalize(&payload, None)
    }

    fn is_error(events: &[StreamEvent]) -> bool {
        matches!(events, [StreamEvent::Error { .. }])
    }

    #[test]
    fn test_internal_token() {
        assert_eq!(
            one(json!({"type": "token", "content": "hi"})),
            vec![StreamEvent::token("hi")]
        );
    }

    #[test]
    fn test_token_with_non_string_content_is_single_error() {
        let events = one(json!({"type": "token", "content": 42}));
        assert!(is_error(&events), "{:?}", events);
    }

    #[test]
    fn test_unknown_type_is_single_error() {
        let events = one(json!({"type": "mystery"}));
        assert!(is_error(&events));
    }

    #[test]
    fn test_unknown_type_falls_back_to_choices() {
        assert!(one(json!({"type": "mystery", "choices": []})).is_empty());
        assert_eq!(
            one(json!({"type": "chat.completion.chunk", "choices": [{"delta": {"content": "hi"}}]})),
            vec![StreamEvent::token("hi")]
        );
    }

    #[test]
    fn test_no_type_no_choices_is_single_error() {
        assert!(is_error(&one(json!({"hello": "world"}))));
        assert!(is_error(&one(json!([1, 2, 3]))));
    }

    #[test]
    fn test_empty_content_block_delta_is_ignored() {
        assert!(one(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": ""}})).is_empty());
        assert!(one(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta"}})).is_empty());
        assert!(one(json!({"type": "content_block_delta", "index": 0})).is_empty());
    }

    #[test]
    fn test_keepalive_frames_are_ignored() {
        assert!(one(json!({"type": "ping"})).is_empty());
        assert!(one(json!({"type": "content_block_stop", "index": 0})).is_empty());
        assert!(one(json!({"type": "response.in_progress", "response": {}})).is_empty());
    }

    #[test]
    fn test_event_name_used_only_without_type() {
        let mut n = EventNormalizer::new();
        let events = n.normalize(&json!({"content": "x"}), Some("token"));
        assert_eq!(events, vec![StreamEvent::token("x")]);

        // An explicit type wins over the event name.
        let events = n.normalize(&json!({"type": "ping"}), Some("token"));
        assert!(events.is_empty());
    }

    #[test]
    fn test_internal_done_and_bad_finish_reason() {
        assert_eq!(
            one(json!({"type": "done", "usage": {"inputTokens": 2, "outputTokens": 3}, "finishReason": "length"})),
            vec![StreamEvent::done(TokenUsage::new(2, 3), FinishReason::Length)]
        );
        assert!(is_error(&one(json!({"type": "done", "finishReason": "sideways"}))));
    }

    #[test]
    fn test_internal_tool_call_end_and_compaction() {
        let events = one(json!({"type": "tool_call_end", "callId": "c1", "name": "grep", "result": {"hits": 2}}));
        assert_eq!(
            events,
            vec![StreamEvent::ToolCallEnd {
                call_id: "c1".into(),
                name: "grep".into(),
                result: json!({"hits": 2}),
                error: None
            }]
        );
        let events = one(json!({"type": "compaction", "summary": "s", "tokensBefore": 900, "tokensAfter": 120}));
        assert!(matches!(events.as_slice(), [StreamEvent::Compaction { tokens_before: 900, .. }]));
        assert!(is_error(&one(json!({"type": "compaction", "summary": "s", "tokensBefore": "many", "tokensAfter": 1}))));
    }

    #[test]
    fn test_anthropic_sequence_with_tool_use() {
        let mut n = EventNormalizer::new();
        let frames = [
            json!({"type": "message_start", "message": {"id": "msg_1", "model": "claude-sonnet-4", "usage": {"input_tokens": 25, "output_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Checking"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"city\": "}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "\"Paris\"}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 40}}),
            json!({"type": "message_stop"}),
        ];
        let events: Vec<StreamEvent> = frames.iter().flat_map(|f| n.normalize(f, None)).collect();

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], StreamEvent::MessageStart { message_id, .. } if message_id == "msg_1"));
        assert_eq!(events[1], StreamEvent::token("Checking"));
        match &events[2] {
            StreamEvent::ToolCallStart { tool_call } => {
                assert_eq!(tool_call.id, "toolu_1");
                assert_eq!(tool_call.arguments["city"], "Paris");
            }
            other => panic!("expected tool call, got {:?}", other),
        }
        assert_eq!(
            events[3],
            StreamEvent::done(TokenUsage::new(25, 40), FinishReason::ToolUse)
        );
    }

    #[test]
    fn test_anthropic_error_event() {
        let events = one(json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}));
        match &events[..] {
            [StreamEvent::Error { error }] => {
                assert_eq!(error.kind, StreamErrorKind::Provider);
                assert_eq!(error.message, "Overloaded");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_responses_sequence() {
        let mut n = EventNormalizer::new();
        let frames = [
            json!({"type": "response.created", "response": {"id": "resp_1", "model": "gpt-4.1", "status": "in_progress"}}),
            json!({"type": "response.output_item.added", "output_index": 0, "item": {"type": "message"}}),
            json!({"type": "response.output_text.delta", "item_id": "m", "delta": "Hel"}),
            json!({"type": "response.output_text.delta", "item_id": "m", "delta": "lo"}),
            json!({"type": "response.output_item.done", "item": {"type": "function_call", "call_id": "call_1", "name": "lookup", "arguments": "{\"q\":1}"}}),
            json!({"type": "response.completed", "response": {"id": "resp_1", "status": "completed", "usage": {"input_tokens": 9, "output_tokens": 4, "total_tokens": 13}}}),
        ];
        let events: Vec<StreamEvent> = frames.iter().flat_map(|f| n.normalize(f, None)).collect();
        assert_eq!(events.len(), 5);
        assert_eq!(events[1], StreamEvent::token("Hel"));
        assert_eq!(events[2], StreamEvent::token("lo"));
        assert!(matches!(&events[3], StreamEvent::ToolCallStart { tool_call } if tool_call.name == "lookup"));
        assert_eq!(
            events[4],
            StreamEvent::done(TokenUsage::with_total(9, 4, 13), FinishReason::ToolUse)
        );
    }

    #[test]
    fn test_choices_fallback_text_and_finish() {
        let mut n = EventNormalizer::new();
        let a = n.normalize(&json!({"id": "c", "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hi"}, "finish_reason": null}]}), None);
        assert_eq!(a, vec![StreamEvent::token("Hi")]);
        let b = n.normalize(&json!({"id": "c", "choices": [{"index": 0, "delta": {}, "finish_reason": "length"}]}), None);
        assert!(b.is_empty());
        assert_eq!(
            n.finish(),
            Some(StreamEvent::done(TokenUsage::zero(), FinishReason::Length))
        );
        assert_eq!(n.finish(), None);
    }

    #[test]
    fn test_choices_finish_waits_for_usage_trailer() {
        let mut n = EventNormalizer::new();
        n.normalize(&json!({"choices": [{"delta": {"content": "Hi"}}], "usage": null}), None);
        let finish = n.normalize(&json!({"choices": [{"delta": {}, "finish_reason": "stop"}], "usage": null}), None);
        assert!(finish.is_empty());
        let trailer = n.normalize(
            &json!({"choices": [], "usage": {"prompt_tokens": 8, "completion_tokens": 1, "total_tokens": 9}}),
            None,
        );
        assert_eq!(
            trailer,
            vec![StreamEvent::done(TokenUsage::with_total(8, 1, 9), FinishReason::Stop)]
        );
        assert_eq!(n.finish(), None);
    }

    #[test]
    fn test_choices_fallback_assembles_tool_calls() {
        let mut n = EventNormalizer::new();
        let mut events = n.normalize(&json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_a", "function": {"name": "sum", "arguments": "{\"a\":"}}]}}]}), None);
        events.extend(n.normalize(&json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "1}"}}]}}]}), None));
        assert!(events.is_empty());
        events.extend(n.normalize(&json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}], "usage": {"prompt_tokens": 5, "completion_tokens": 2}}), None));
        match &events[..] {
            [StreamEvent::ToolCallStart { tool_call }, StreamEvent::Done { usage, finish_reason }] => {
                assert_eq!(tool_call.id, "call_a");
                assert_eq!(tool_call.arguments["a"], 1);
                assert_eq!(*usage, TokenUsage::new(5, 2));
                assert_eq!(*finish_reason, FinishReason::ToolUse);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn estimate_request() -> ChatRequest {
        use crate::types::ChatMessage;
        ChatRequest::new("m", vec![ChatMessage::user("What is the capital of France?")])
    }

    #[test]
    fn test_choices_without_usage_is_estimated_for_request() {
        let request = estimate_request();
        let mut n = EventNormalizer::for_request(&request);
        let mut events = n.normalize(&json!({"choices": [{"delta": {"content": "Paris is"}}]}), None);
        events.extend(n.normalize(&json!({"choices": [{"delta": {"content": " the capital"}}]}), None));
        events.extend(n.normalize(&json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}), None));
        events.extend(n.finish());

        let expected = TokenUsage::new(
            usage::estimate_request_tokens(&request),
            usage::estimate_tokens("Paris is the capital"),
        );
        assert!(expected.input_tokens > 0 && expected.output_tokens > 0);
        assert_eq!(events.last(), Some(&StreamEvent::done(expected, FinishReason::Stop)));
    }

    #[test]
    fn test_reported_usage_wins_over_estimate() {
        let mut n = EventNormalizer::for_request(&estimate_request());
        n.normalize(&json!({"choices": [{"delta": {"content": "Paris"}}]}), None);
        let events = n.normalize(
            &json!({"choices": [{"delta": {}, "finish_reason": "stop"}], "usage": {"prompt_tokens": 14, "completion_tokens": 1, "total_tokens": 15}}),
            None,
        );
        assert_eq!(
            events,
            vec![StreamEvent::done(TokenUsage::with_total(14, 1, 15), FinishReason::Stop)]
        );
    }

    #[test]
    fn test_missing_vendor_counts_are_estimated() {
        let request = estimate_request();
        let prompt = usage::estimate_request_tokens(&request);

        // Anthropic without message_delta usage keeps the start count.
        let mut n = EventNormalizer::for_request(&request);
        n.normalize(&json!({"type": "message_start", "message": {"id": "m1", "usage": {"input_tokens": 30}}}), None);
        n.normalize(&json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Paris"}}), None);
        let events = n.normalize(&json!({"type": "message_stop"}), None);
        assert_eq!(
            events,
            vec![StreamEvent::done(TokenUsage::new(30, usage::estimate_tokens("Paris")), FinishReason::Stop)]
        );

        // Responses completion without a usage object.
        let mut n = EventNormalizer::for_request(&request);
        n.normalize(&json!({"type": "response.output_text.delta", "delta": "Paris"}), None);
        let events = n.normalize(&json!({"type": "response.completed", "response": {"status": "completed"}}), None);
        assert_eq!(
            events,
            vec![StreamEvent::done(TokenUsage::new(prompt, usage::estimate_tokens("Paris")), FinishReason::Stop)]
        );
    }

    #[test]
    fn test_choices_non_string_content_is_error() {
        assert!(is_error(&one(json!({"choices": [{"delta": {"content": {"nested": true}}}]}))));
    }
}
