//! Heuristic model limits derived from the model identifier.
//!
//! Used to annotate catalog entries when the backend does not report a
//! context window itself. Matching is by lowercase substring, most specific
//! first.

use crate::types::ModelCapability;

/// Context window used when nothing matches.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 8_192;

/// Context window (input + output tokens) for a model id.
pub fn context_window_for(model_id: &str) -> u32 {
    let m = model_id.to_ascii_lowercase();
    match m.as_str() {
        // Anthropic
        m if m.contains("claude-2") || m.contains("claude-instant") => 100_000,
        m if m.contains("claude") => 200_000,

        // OpenAI
        m if m.contains("gpt-4.1") => 1_047_576,
        m if m.contains("gpt-5") => 400_000,
        m if m.contains("gpt-4o") || m.contains("gpt-4-turbo") => 128_000,
        m if m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4") => 200_000,
        m if m.contains("gpt-4-32k") => 32_768,
        m if m.contains("gpt-4") => 8_192,
        m if m.contains("gpt-3.5") => 16_385,

        // Google
        m if m.contains("gemini-1.5-pro") => 2_097_152,
        m if m.contains("gemini") => 1_048_576,
        m if m.contains("gemma-3") || m.contains("gemma3") => 131_072,
        m if m.contains("gemma") => 8_192,

        // Open-weight families served locally
        m if m.contains("llama3.1")
            || m.contains("llama-3.1")
            || m.contains("llama3.2")
            || m.contains("llama-3.2")
            || m.contains("llama3.3")
            || m.contains("llama-3.3") =>
        {
            131_072
        }
        m if m.contains("llama3") || m.contains("llama-3") => 8_192,
        m if m.contains("qwen3") || m.contains("qwen2.5") || m.contains("qwen-2.5") => 32_768,
        m if m.contains("mistral-nemo") || m.contains("mistral-small") => 131_072,
        m if m.contains("mixtral") || m.contains("mistral") => 32_768,
        m if m.contains("deepseek") => 131_072,
        m if m.contains("phi-4") || m.contains("phi4") => 16_384,
        m if m.contains("phi3") || m.contains("phi-3") => 131_072,
        m if m.contains("gpt-oss") => 131_072,

        _ => DEFAULT_CONTEXT_WINDOW,
    }
}

/// Hard max-output-tokens for a model id, when known.
pub fn max_output_for(model_id: &str) -> Option<u32> {
    let m = model_id.to_ascii_lowercase();
    match m.as_str() {
        m if m.contains("claude-opus-4") => Some(32_000),
        m if m.contains("claude-sonnet-4") || m.contains("claude-3-7") => Some(64_000),
        m if m.contains("claude-3-5") => Some(8_192),
        m if m.contains("claude") => Some(4_096),
        m if m.contains("gpt-4.1") => Some(32_768),
        m if m.contains("gpt-4o") => Some(16_384),
        m if m.contains("gemini-2.5") => Some(65_536),
        m if m.contains("gemini") => Some(8_192),
        _ => None,
    }
}

/// Capabilities inferred from a local model id.
pub fn capabilities_for(model_id: &str) -> Vec<ModelCapability> {
    let m = model_id.to_ascii_lowercase();
    let mut caps = vec![ModelCapability::Chat, ModelCapability::Streaming];
    if ["llama3.1", "llama3.2", "llama3.3", "qwen", "mistral", "gpt-oss", "command-r", "hermes"]
        .iter()
        .any(|family| m.contains(family))
    {
        caps.push(ModelCapability::ToolUse);
    }
    if ["llava", "vision", "-vl", "gemma3", "gemma-3", "pixtral", "moondream"]
        .iter()
        .any(|family| m.contains(family))
    {
        caps.push(ModelCapability::Vision);
    }
    caps
}
