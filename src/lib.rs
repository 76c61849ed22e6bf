//! Switchyard LLM - one chat contract over commercial and local backends
//!
//! Every backend is reached through the same [`LLMProvider`] trait:
//! a non-streaming `chat`, a cancellable `stream` of canonical
//! [`StreamEvent`]s, a model catalog and a reachability check.
//!
//! # Providers
//!
//! | Provider | Chat | Stream framing | Models | Notes |
//! |----------|------|----------------|--------|-------|
//! | Anthropic | ✓ | SSE | static | Messages API, extended thinking |
//! | OpenAI | ✓ | SSE | live | Responses API, reasoning effort |
//! | Gemini | ✓ | SSE | live | `generateContent`, thinking budget |
//! | Ollama | ✓ | NDJSON | live | Local, health + metrics sidecars |
//! | LM Studio | ✓ | SSE / chunked text | live | Any OpenAI-compatible local server |
//!
//! # Streaming guarantees
//!
//! - No I/O happens until the stream is first polled.
//! - Every stream that is not cancelled ends with exactly one
//!   [`StreamEvent::Done`].
//! - Transport and HTTP failures arrive in-band as [`StreamEvent::Error`]
//!   followed by a zero-usage `Done`.
//! - After the [`CancellationToken`](tokio_util::sync::CancellationToken)
//!   fires, nothing more is yielded.
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use switchyard_llm::{ChatMessage, ChatRequest, LLMProvider, OllamaProvider, StreamEvent};
//! use tokio_util::sync::CancellationToken;
//!
//! let provider = OllamaProvider::from_env()?;
//! let request = ChatRequest::new("", vec![ChatMessage::user("Hello!")]);
//!
//! let mut events = provider.stream(&request, CancellationToken::new());
//! while let Some(event) = events.next().await {
//!     if let StreamEvent::Token { content } = event {
//!         print!("{content}");
//!     }
//! }
//! ```
//!
//! # See Also
//!
//! - [`crate::traits`] for the provider contract
//! - [`crate::providers`] for concrete implementations
//! - [`crate::streaming`] for the frame parsers and event normalizer

pub mod config;
pub mod error;
pub mod factory;
pub mod finish_reason;
pub mod health;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod streaming;
pub mod thinking;
pub mod traits;
pub mod types;
pub mod usage;

pub use config::{ProviderSettings, SettingsFile};
pub use error::{LlmError, Result};
pub use factory::{ProviderFactory, ProviderType};
pub use health::{BackendKind, HealthMonitor, HealthStatus, ProviderHealth};
pub use metrics::{InferenceTimer, MetricsSummary, MetricsTracker, PerformanceMetrics};
pub use providers::{
    AnthropicProvider, GeminiProvider, LMStudioProvider, LMStudioProviderBuilder,
    OllamaProvider, OllamaProviderBuilder, OpenAIProvider, TracingProvider,
};
pub use streaming::{EventNormalizer, PayloadMapper};
pub use traits::{EventStream, LLMProvider};
pub use types::{
    AuthMode, ChatMessage, ChatRequest, ChatResponse, ChatRole, ContentBlock, FinishReason,
    Framing, MessageContent, Model, ModelCapability, ProviderCapabilities, StreamError,
    StreamErrorKind, StreamEvent, ThinkingLevel, TokenUsage, ToolCall, ToolDefinition,
};
