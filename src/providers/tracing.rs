//! Tracing wrapper that adds GenAI span attributes to any provider.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  Caller             │
//! └─────────┬───────────┘
//!           │ chat(), stream()
//!           ▼
//! ┌─────────────────────┐
//! │  TracingProvider    │  ← Creates spans with GenAI attributes
//! │  • gen_ai.operation │
//! │  • gen_ai.system    │
//! │  • gen_ai.request.* │
//! │  • gen_ai.usage.*   │
//! └─────────┬───────────┘
//!           │ delegates
//!           ▼
//! ┌─────────────────────┐
//! │  Inner Provider     │
//! └─────────────────────┘
//! ```
//!
//! Attribute names follow the OpenTelemetry GenAI semantic conventions:
//! <https://opentelemetry.io/docs/specs/semconv/gen-ai/gen-ai-spans/>
//!
//! Message content is only recorded when `SWITCHYARD_CAPTURE_CONTENT` is
//! `true` or `1`.

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument, Span};

use crate::error::Result;
use crate::traits::{EventStream, LLMProvider};
use crate::types::{ChatRequest, ChatResponse, Model, ProviderCapabilities, StreamEvent};

/// GenAI semantic convention attribute names.
pub mod genai_attrs {
    /// The name of the operation being performed.
    pub const OPERATION_NAME: &str = "gen_ai.operation.name";
    /// The name of the GenAI system (provider).
    pub const SYSTEM: &str = "gen_ai.system";
    /// The requested model name.
    pub const REQUEST_MODEL: &str = "gen_ai.request.model";
    /// Maximum tokens to generate.
    pub const REQUEST_MAX_TOKENS: &str = "gen_ai.request.max_tokens";
    /// Temperature for generation.
    pub const REQUEST_TEMPERATURE: &str = "gen_ai.request.temperature";
    /// The actual model used in response.
    pub const RESPONSE_MODEL: &str = "gen_ai.response.model";
    /// Input/prompt token count.
    pub const USAGE_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";
    /// Output/completion token count.
    pub const USAGE_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";
    /// Finish reasons array.
    pub const RESPONSE_FINISH_REASONS: &str = "gen_ai.response.finish_reasons";
}

const CAPTURE_CONTENT_ENV: &str = "SWITCHYARD_CAPTURE_CONTENT";

/// Whether prompt and completion text may be recorded on spans. Off unless opted in.
fn should_capture_content() -> bool {
    std::env::var(CAPTURE_CONTENT_ENV)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Decorator that wraps every call of the inner provider in a GenAI span.
///
/// # Example
///
/// ```ignore
/// use switchyard_llm::providers::{OpenAIProvider, TracingProvider};
///
/// let traced = TracingProvider::new(OpenAIProvider::new("api-key"));
/// let response = traced.chat(&request).await?;
/// ```
pub struct TracingProvider<P: LLMProvider> {
    inner: P,
}

impl<P: LLMProvider> TracingProvider<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn into_inner(self) -> P {
        self.inner
    }

    fn span(&self, operation: &'static str, request: &ChatRequest) -> Span {
        let span = info_span!(
            "gen_ai.chat",
            { genai_attrs::OPERATION_NAME } = operation,
            { genai_attrs::SYSTEM } = self.inner.name(),
            { genai_attrs::REQUEST_MODEL } = request.model_or(self.inner.model()),
            { genai_attrs::REQUEST_MAX_TOKENS } = request.max_tokens.map(i64::from),
            { genai_attrs::REQUEST_TEMPERATURE } = request.temperature.map(f64::from),
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            { genai_attrs::RESPONSE_MODEL } = tracing::field::Empty,
            { genai_attrs::USAGE_INPUT_TOKENS } = tracing::field::Empty,
            { genai_attrs::USAGE_OUTPUT_TOKENS } = tracing::field::Empty,
            { genai_attrs::RESPONSE_FINISH_REASONS } = tracing::field::Empty,
            "gen_ai.prompt" = tracing::field::Empty,
            "gen_ai.completion.content" = tracing::field::Empty,
            error = tracing::field::Empty,
        );

        if should_capture_content() {
            if let Ok(messages_json) = serde_json::to_string(&request.messages) {
                span.record("gen_ai.prompt", messages_json.as_str());
            }
        }
        span
    }
}

#[async_trait]
impl<P: LLMProvider + 'static> LLMProvider for TracingProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.inner.capabilities()
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let span = self.span("chat", request);

        let response = match self.inner.chat(request).instrument(span.clone()).await {
            Ok(response) => response,
            Err(e) => {
                span.record("error", e.to_string().as_str());
                return Err(e);
            }
        };

        span.record(genai_attrs::RESPONSE_MODEL, response.model.as_str());
        span.record(genai_attrs::USAGE_INPUT_TOKENS, response.usage.input_tokens);
        span.record(genai_attrs::USAGE_OUTPUT_TOKENS, response.usage.output_tokens);
        span.record(
            genai_attrs::RESPONSE_FINISH_REASONS,
            response.finish_reason.as_str(),
        );
        if should_capture_content() {
            span.record("gen_ai.completion.content", response.content.as_str());
        }

        tracing::info!(
            target: "gen_ai.usage",
            parent: &span,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            model = %response.model,
            "chat completion"
        );
        Ok(response)
    }

    /// Events pass through unchanged; usage and errors are recorded on the
    /// span as they go by.
    fn stream(&self, request: &ChatRequest, cancel: CancellationToken) -> EventStream {
        let span = self.span("stream", request);
        let mut inner = {
            let _entered = span.enter();
            self.inner.stream(request, cancel)
        };

        Box::pin(async_stream::stream! {
            while let Some(event) = inner.next().await {
                match &event {
                    StreamEvent::MessageStart { model: Some(model), .. } => {
                        span.record(genai_attrs::RESPONSE_MODEL, model.as_str());
                    }
                    StreamEvent::Error { error } => {
                        span.record("error", error.message.as_str());
                    }
                    StreamEvent::Done { usage, finish_reason } => {
                        span.record(genai_attrs::USAGE_INPUT_TOKENS, usage.input_tokens);
                        span.record(genai_attrs::USAGE_OUTPUT_TOKENS, usage.output_tokens);
                        span.record(genai_attrs::RESPONSE_FINISH_REASONS, finish_reason.as_str());
                        tracing::info!(
                            target: "gen_ai.usage",
                            parent: &span,
                            input_tokens = usage.input_tokens,
                            output_tokens = usage.output_tokens,
                            "stream finished"
                        );
                    }
                    _ => {}
                }
                yield event;
            }
        })
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        let span = info_span!(
            "gen_ai.list_models",
            { genai_attrs::SYSTEM } = self.inner.name(),
        );
        self.inner.list_models().instrument(span).await
    }

    async fn validate_connection(&self) -> bool {
        self.inner.validate_connection().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::types::{
        AuthMode, ChatMessage, FinishReason, Framing, StreamErrorKind, TokenUsage,
    };
    use serial_test::serial;

    /// Scripted provider used to observe delegation.
    struct ScriptedProvider {
        fail: bool,
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-1"
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                id: "scripted",
                display_name: "Scripted",
                auth_modes: vec![AuthMode::None],
                framing: Framing::Sse,
                local: true,
                supports_thinking: false,
                supports_tools: false,
            }
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
            if self.fail {
                return Err(LlmError::http("scripted", 503, "overloaded"));
            }
            Ok(ChatResponse {
                id: "r1".into(),
                model: "scripted-1".into(),
                content: "hello".into(),
                tool_calls: Vec::new(),
                usage: TokenUsage::new(3, 1),
                finish_reason: FinishReason::Stop,
            })
        }

        fn stream(&self, _request: &ChatRequest, _cancel: CancellationToken) -> EventStream {
            let events = if self.fail {
                vec![
                    StreamEvent::error(StreamErrorKind::Transport, "reset"),
                    StreamEvent::synthetic_done(),
                ]
            } else {
                vec![
                    StreamEvent::token("hel"),
                    StreamEvent::token("lo"),
                    StreamEvent::done(TokenUsage::new(3, 1), FinishReason::Stop),
                ]
            };
            Box::pin(futures::stream::iter(events))
        }

        async fn list_models(&self) -> Result<Vec<Model>> {
            Ok(Vec::new())
        }

        async fn validate_connection(&self) -> bool {
            !self.fail
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new("", vec![ChatMessage::user("hi")]).with_max_tokens(10)
    }

    #[test]
    fn test_delegates_identity() {
        let traced = TracingProvider::new(ScriptedProvider { fail: false });
        assert_eq!(traced.name(), "scripted");
        assert_eq!(traced.model(), "scripted-1");
        assert_eq!(traced.capabilities().id, "scripted");
        assert_eq!(traced.inner().name(), "scripted");
        assert_eq!(traced.into_inner().model(), "scripted-1");
    }

    #[tokio::test]
    async fn test_chat_passes_response_through() {
        let traced = TracingProvider::new(ScriptedProvider { fail: false });
        let response = traced.chat(&request()).await.unwrap();
        assert_eq!(response.content, "hello");
        assert!(traced.validate_connection().await);
    }

    #[tokio::test]
    async fn test_chat_passes_error_through() {
        let traced = TracingProvider::new(ScriptedProvider { fail: true });
        let err = traced.chat(&request()).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn test_stream_events_unchanged() {
        for fail in [false, true] {
            let inner = ScriptedProvider { fail };
            let expected: Vec<StreamEvent> =
                inner.stream(&request(), CancellationToken::new()).collect().await;
            let traced = TracingProvider::new(inner);
            let events: Vec<StreamEvent> =
                traced.stream(&request(), CancellationToken::new()).collect().await;
            assert_eq!(events, expected);
        }
    }

    #[test]
    #[serial]
    fn test_capture_content_is_opt_in() {
        std::env::remove_var(CAPTURE_CONTENT_ENV);
        assert!(!should_capture_content());
        std::env::set_var(CAPTURE_CONTENT_ENV, "1");
        assert!(should_capture_content());
        std::env::remove_var(CAPTURE_CONTENT_ENV);
    }
}
