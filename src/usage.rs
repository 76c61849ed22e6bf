//! Token accounting: prefer backend-reported counts, otherwise estimate.

use crate::types::{ChatRequest, ContentBlock, MessageContent, TokenUsage};

/// Characters per token estimation (average across models).
pub const CHARS_PER_TOKEN: usize = 4;

/// Rough token count for a piece of text.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN) as u64
}

/// Rough prompt size for a request: system prompt, every message and tool schema.
pub fn estimate_request_tokens(request: &ChatRequest) -> u64 {
    let mut total = request
        .system_prompt
        .as_deref()
        .map(estimate_tokens)
        .unwrap_or(0);

    for message in &request.messages {
        total += match &message.content {
            MessageContent::Text(text) => estimate_tokens(text),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => estimate_tokens(text),
                    ContentBlock::ToolUse { name, input, .. } => {
                        estimate_tokens(name)
                            + estimate_tokens(&serde_json::Value::Object(input.clone()).to_string())
                    }
                    ContentBlock::ToolResult { content, .. } => estimate_tokens(content),
                })
                .sum(),
        };
    }

    for tool in &request.tools {
        total += estimate_tokens(&tool.name)
            + estimate_tokens(&tool.description)
            + estimate_tokens(&tool.parameters.to_string());
    }
    total
}

/// Build usage from whatever the backend reported, estimating the rest.
///
/// A reported total is kept as-is; otherwise total is input + output.
pub fn reported_or_estimated(
    input: Option<u64>,
    output: Option<u64>,
    total: Option<u64>,
    request: &ChatRequest,
    output_text: &str,
) -> TokenUsage {
    fill_missing(input, output, total, estimate_request_tokens(request), output_text)
}

/// Like [`reported_or_estimated`] with the prompt already estimated, for
/// streams that no longer hold the request.
pub fn fill_missing(
    input: Option<u64>,
    output: Option<u64>,
    total: Option<u64>,
    prompt_tokens: u64,
    output_text: &str,
) -> TokenUsage {
    let estimated = input.is_none() || output.is_none();
    let input = input.unwrap_or(prompt_tokens);
    let output = output.unwrap_or_else(|| estimate_tokens(output_text));
    match total {
        Some(total) if !estimated => TokenUsage::with_total(input, output, total),
        _ => TokenUsage::new(input, output),
    }
}
