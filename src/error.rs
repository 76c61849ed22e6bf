//! Error taxonomy for provider operations.
//!
//! # Failure classes
//!
//! | Class | Variant | Surfaced as |
//! |-------|---------|-------------|
//! | Transport / connect | `NetworkError`, `Timeout` | thrown from `chat`, `error` event from `stream` |
//! | Non-2xx HTTP | `Http { status, body }` | thrown from `chat`, `error` event from `stream` |
//! | Unexpected JSON shape | `MalformedResponse` | thrown from `chat`, `error` event from `stream` |
//! | Caller cancellation | `Cancelled` | thrown from `chat`; a cancelled stream simply ends |
//!
//! Nothing in this crate retries. [`LlmError::is_transient`] is informational
//! for callers that want to implement their own policy.

use thiserror::Error;

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, LlmError>;

// ============================================================================
// LLM Error Types
// ============================================================================

/// Errors that can occur while talking to a backend.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The backend answered with a non-2xx status.
    #[error("{provider} returned HTTP {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    /// The backend answered 2xx but the payload did not have the expected shape.
    #[error("{provider} returned a malformed response: {reason}")]
    MalformedResponse { provider: String, reason: String },

    /// Invalid request parameters.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Network error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Timeout error.
    #[error("Request timed out")]
    Timeout,

    /// The caller's cancellation token fired before the call finished.
    #[error("Request cancelled")]
    Cancelled,

    /// Feature not supported.
    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else if err.is_connect() {
            LlmError::NetworkError(format!("Connection failed: {}", err))
        } else {
            LlmError::NetworkError(err.to_string())
        }
    }
}

impl LlmError {
    /// Build an HTTP error for `provider`.
    pub fn http(provider: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            provider: provider.into(),
            status,
            body: body.into(),
        }
    }

    /// Build a malformed-response error for `provider`.
    pub fn malformed(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the same request might succeed if re-issued later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError(_) | Self::Timeout => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Get a user-friendly description of the error with suggested action.
    ///
    /// # Example
    ///
    /// ```
    /// use switchyard_llm::LlmError;
    ///
    /// let error = LlmError::http("anthropic", 401, "invalid x-api-key");
    /// assert!(error.user_description().contains("API key"));
    /// ```
    pub fn user_description(&self) -> String {
        match self {
            Self::Http { status: 401, .. } | Self::Http { status: 403, .. } => {
                "Authentication failed. Please check your API key is valid and not expired."
                    .to_string()
            }
            Self::Http { status: 429, .. } => {
                "Rate limited by the API. Wait before sending another request.".to_string()
            }
            Self::Http {
                provider, status, ..
            } if *status >= 500 => format!("{} is having server trouble (HTTP {}).", provider, status),
            Self::Http {
                provider,
                status,
                body,
            } => format!("{} rejected the request (HTTP {}): {}", provider, status, body),
            Self::MalformedResponse { provider, .. } => {
                format!("{} sent a response this client could not understand.", provider)
            }
            Self::NetworkError(_) => {
                "Unable to reach the backend. Check the base URL and your connection.".to_string()
            }
            Self::Timeout => "Request timed out. The server may be overloaded.".to_string(),
            Self::Cancelled => "Request cancelled.".to_string(),
            Self::InvalidRequest(msg) => {
                format!("Invalid request: {}. Check your parameters.", msg)
            }
            Self::ConfigError(msg) => format!("Configuration error: {}.", msg),
            Self::NotSupported(feature) => {
                format!("Feature '{}' is not supported by this provider.", feature)
            }
            Self::SerializationError(_) => {
                "Failed to encode or decode JSON for this request.".to_string()
            }
        }
    }
}
