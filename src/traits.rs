//! The contract every backend adapter implements.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{ChatRequest, ChatResponse, Model, ProviderCapabilities, StreamEvent};

/// A lazy, single-pass stream of canonical events.
///
/// Ends with exactly one [`StreamEvent::Done`], unless cancelled, in which
/// case it simply ends.
pub type EventStream = BoxStream<'static, StreamEvent>;

/// Trait for chat backends.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Provider id, e.g. `"anthropic"`.
    fn name(&self) -> &str;

    /// Default model used when a request leaves `model` empty.
    fn model(&self) -> &str;

    /// Static identity and declared auth modes.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Run a non-streaming chat completion.
    ///
    /// Fails with [`LlmError::Http`](crate::LlmError::Http) on a non-2xx
    /// status and [`LlmError::MalformedResponse`](crate::LlmError::MalformedResponse)
    /// when the payload has an unexpected shape.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Start a streaming chat completion.
    ///
    /// No I/O happens until the returned stream is first polled. Failures are
    /// reported in-band as an `error` event followed by a zero-usage `done`.
    /// Once `cancel` fires the stream yields nothing more.
    fn stream(&self, request: &ChatRequest, cancel: CancellationToken) -> EventStream;

    /// Models this backend offers.
    async fn list_models(&self) -> Result<Vec<Model>>;

    /// Cheap reachability/credential check. Never fails; errors collapse to `false`.
    async fn validate_connection(&self) -> bool;
}
