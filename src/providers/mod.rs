//! LLM provider implementations.

pub(crate) mod http;

pub mod anthropic;
pub use anthropic::AnthropicProvider;

pub mod openai;
pub use openai::OpenAIProvider;

pub mod gemini;
pub use gemini::GeminiProvider;

pub mod ollama;
pub use ollama::{OllamaProvider, OllamaProviderBuilder};

pub mod lmstudio;
pub use lmstudio::{LMStudioProvider, LMStudioProviderBuilder};

// GenAI semantic-convention spans around any provider
pub mod tracing;
pub use self::tracing::TracingProvider;
