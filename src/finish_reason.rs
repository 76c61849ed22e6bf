//! Backend finish-reason vocabularies mapped onto [`FinishReason`].

use crate::types::FinishReason;

/// Anthropic `stop_reason`.
pub fn from_anthropic(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" | "pause_turn" => FinishReason::Stop,
        "tool_use" => FinishReason::ToolUse,
        "max_tokens" | "model_context_window_exceeded" => FinishReason::Length,
        "refusal" => FinishReason::Error,
        _ => FinishReason::Stop,
    }
}

/// OpenAI-compatible `choices[].finish_reason` (also used by LM Studio, llama.cpp, vLLM).
pub fn from_openai_compatible(reason: &str) -> FinishReason {
    match reason {
        "stop" | "eos" => FinishReason::Stop,
        "tool_calls" | "function_call" => FinishReason::ToolUse,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::Error,
        _ => FinishReason::Stop,
    }
}

/// OpenAI Responses API `status` plus `incomplete_details.reason`.
pub fn from_responses_status(
    status: &str,
    incomplete_reason: Option<&str>,
    emitted_tool_calls: bool,
) -> FinishReason {
    match status {
        "completed" if emitted_tool_calls => FinishReason::ToolUse,
        "completed" => FinishReason::Stop,
        "incomplete" => match incomplete_reason {
            Some("max_output_tokens") => FinishReason::Length,
            Some("content_filter") => FinishReason::Error,
            _ => FinishReason::Length,
        },
        "failed" | "cancelled" => FinishReason::Error,
        _ => FinishReason::Stop,
    }
}

/// Gemini `finishReason`.
pub fn from_gemini(reason: &str, emitted_tool_calls: bool) -> FinishReason {
    match reason {
        "STOP" if emitted_tool_calls => FinishReason::ToolUse,
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
        | "MALFORMED_FUNCTION_CALL" | "LANGUAGE" | "OTHER" => FinishReason::Error,
        _ => FinishReason::Stop,
    }
}

/// Ollama `done_reason`.
pub fn from_ollama(reason: Option<&str>, emitted_tool_calls: bool) -> FinishReason {
    if emitted_tool_calls {
        return FinishReason::ToolUse;
    }
    match reason {
        Some("length") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}
