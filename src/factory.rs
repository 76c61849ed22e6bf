//! Provider construction from settings or the environment.
//!
//! # Environment Variables
//!
//! ## Provider Selection
//!
//! - `SWITCHYARD_PROVIDER`: explicit selection (anthropic|openai|gemini|ollama|lmstudio)
//!
//! ## Provider-Specific Configuration
//!
//! See individual provider documentation:
//! - Anthropic: `ANTHROPIC_API_KEY`, `ANTHROPIC_BASE_URL`, `ANTHROPIC_MODEL`
//! - OpenAI: `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `OPENAI_MODEL`
//! - Gemini: `GEMINI_API_KEY` or `GOOGLE_API_KEY`, `GEMINI_BASE_URL`, `GEMINI_MODEL`
//! - Ollama: `OLLAMA_HOST`, `OLLAMA_MODEL`
//! - LM Studio: `LMSTUDIO_HOST`, `LMSTUDIO_MODEL`, `LMSTUDIO_API_KEY`
//!
//! # Auto-Detection Priority
//!
//! When `SWITCHYARD_PROVIDER` is not set:
//! 1. `OLLAMA_HOST` or `OLLAMA_MODEL` → Ollama
//! 2. `LMSTUDIO_HOST` or `LMSTUDIO_MODEL` → LM Studio
//! 3. `ANTHROPIC_API_KEY` → Anthropic
//! 4. `GEMINI_API_KEY` / `GOOGLE_API_KEY` → Gemini
//! 5. `OPENAI_API_KEY` → OpenAI
//!
//! # Example
//!
//! ```rust,ignore
//! use switchyard_llm::{ProviderFactory, ProviderSettings, ProviderType};
//!
//! let settings = ProviderSettings::new(ProviderType::Ollama).with_model("qwen2.5:7b");
//! let llm = ProviderFactory::create(&settings, None)?;
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProviderSettings;
use crate::error::{LlmError, Result};
use crate::providers::{
    AnthropicProvider, GeminiProvider, LMStudioProvider, OllamaProvider, OpenAIProvider,
    TracingProvider,
};
use crate::traits::LLMProvider;

/// The closed set of supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Anthropic Messages API (Claude models)
    #[serde(alias = "claude")]
    Anthropic,
    /// OpenAI Responses API
    OpenAI,
    /// Google Gemini API
    #[serde(alias = "google")]
    Gemini,
    /// Ollama native chat API (local models)
    Ollama,
    /// LM Studio or another OpenAI-compatible local server
    #[serde(alias = "lm-studio", alias = "lm_studio")]
    LMStudio,
}

impl ProviderType {
    pub const ALL: [ProviderType; 5] = [
        ProviderType::Anthropic,
        ProviderType::OpenAI,
        ProviderType::Gemini,
        ProviderType::Ollama,
        ProviderType::LMStudio,
    ];

    /// Canonical lowercase id, the same string adapters report from `name()`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Anthropic => "anthropic",
            ProviderType::OpenAI => "openai",
            ProviderType::Gemini => "gemini",
            ProviderType::Ollama => "ollama",
            ProviderType::LMStudio => "lmstudio",
        }
    }

    /// Whether the backend runs on the user's machine (no credential, health sidecar).
    pub fn is_local(&self) -> bool {
        matches!(self, ProviderType::Ollama | ProviderType::LMStudio)
    }

    /// Environment variables consulted for a credential, in order.
    pub fn default_api_key_envs(&self) -> &'static [&'static str] {
        match self {
            ProviderType::Anthropic => &["ANTHROPIC_API_KEY"],
            ProviderType::OpenAI => &["OPENAI_API_KEY"],
            ProviderType::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
            ProviderType::Ollama => &[],
            ProviderType::LMStudio => &["LMSTUDIO_API_KEY"],
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = LlmError;

    /// Case-insensitive, accepting common aliases.
    ///
    /// ```
    /// use switchyard_llm::ProviderType;
    ///
    /// assert_eq!("claude".parse::<ProviderType>().unwrap(), ProviderType::Anthropic);
    /// assert_eq!("LM-Studio".parse::<ProviderType>().unwrap(), ProviderType::LMStudio);
    /// assert!("mock".parse::<ProviderType>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAI),
            "gemini" | "google" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            "lmstudio" | "lm-studio" | "lm_studio" => Ok(Self::LMStudio),
            other => Err(LlmError::ConfigError(format!(
                "Unknown provider type: {}. Valid options: anthropic, openai, gemini, ollama, lmstudio",
                other
            ))),
        }
    }
}

/// Builds adapters behind `Arc<dyn LLMProvider>`.
pub struct ProviderFactory;

impl ProviderFactory {
    /// Build the adapter described by `settings`.
    ///
    /// `credential` is the already-decrypted API key. When `None`, the key is
    /// read from `settings.api_key_env` or the provider's default variables.
    /// Cloud providers fail with [`LlmError::ConfigError`] when no key is found.
    pub fn create(
        settings: &ProviderSettings,
        credential: Option<String>,
    ) -> Result<Arc<dyn LLMProvider>> {
        settings.validate()?;
        let credential = credential
            .filter(|key| !key.is_empty())
            .or_else(|| settings.credential_from_env());

        debug!(
            provider = %settings.provider_type,
            model = settings.model.as_deref().unwrap_or("<default>"),
            tracing = settings.tracing,
            "Creating provider"
        );

        match settings.provider_type {
            ProviderType::Anthropic => {
                let provider = Self::anthropic(settings, credential)?;
                Ok(Self::finish(provider, settings.tracing))
            }
            ProviderType::OpenAI => {
                let provider = Self::openai(settings, credential)?;
                Ok(Self::finish(provider, settings.tracing))
            }
            ProviderType::Gemini => {
                let provider = Self::gemini(settings, credential)?;
                Ok(Self::finish(provider, settings.tracing))
            }
            ProviderType::Ollama => {
                let provider = Self::ollama(settings)?;
                Ok(Self::finish(provider, settings.tracing))
            }
            ProviderType::LMStudio => {
                let provider = Self::lmstudio(settings, credential)?;
                Ok(Self::finish(provider, settings.tracing))
            }
        }
    }

    /// Like [`create`](Self::create), and additionally start periodic health
    /// probes for local backends when `settings.health_interval_seconds` is set.
    ///
    /// The probe loop stops when `cancel` fires. Must be called inside a
    /// tokio runtime.
    pub fn create_supervised(
        settings: &ProviderSettings,
        credential: Option<String>,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn LLMProvider>> {
        let Some(every) = settings.health_interval() else {
            return Self::create(settings, credential);
        };
        settings.validate()?;

        match settings.provider_type {
            ProviderType::Ollama => {
                let provider = Self::ollama(settings)?;
                provider.spawn_health_checks(every, cancel);
                Ok(Self::finish(provider, settings.tracing))
            }
            ProviderType::LMStudio => {
                let credential = credential.or_else(|| settings.credential_from_env());
                let provider = Self::lmstudio(settings, credential)?;
                provider.spawn_health_checks(every, cancel);
                Ok(Self::finish(provider, settings.tracing))
            }
            other => {
                warn!(provider = %other, "health_interval_seconds ignored for remote provider");
                Self::create(settings, credential)
            }
        }
    }

    /// Select and build a provider from environment variables alone.
    ///
    /// See the module docs for the detection order.
    pub fn from_env() -> Result<Arc<dyn LLMProvider>> {
        if let Ok(provider_str) = std::env::var("SWITCHYARD_PROVIDER") {
            let provider_type = provider_str.parse::<ProviderType>()?;
            return Self::from_env_for(provider_type);
        }

        let set = |name: &str| std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false);

        let detected = if set("OLLAMA_HOST") || set("OLLAMA_MODEL") {
            ProviderType::Ollama
        } else if set("LMSTUDIO_HOST") || set("LMSTUDIO_MODEL") {
            ProviderType::LMStudio
        } else if set("ANTHROPIC_API_KEY") {
            ProviderType::Anthropic
        } else if set("GEMINI_API_KEY") || set("GOOGLE_API_KEY") {
            ProviderType::Gemini
        } else if set("OPENAI_API_KEY") {
            ProviderType::OpenAI
        } else {
            return Err(LlmError::ConfigError(
                "No provider configured. Set SWITCHYARD_PROVIDER or a provider API key/host"
                    .to_string(),
            ));
        };

        debug!(provider = %detected, "Auto-detected provider from environment");
        Self::from_env_for(detected)
    }

    fn from_env_for(provider_type: ProviderType) -> Result<Arc<dyn LLMProvider>> {
        Ok(match provider_type {
            ProviderType::Anthropic => Arc::new(AnthropicProvider::from_env()?),
            ProviderType::OpenAI => Arc::new(OpenAIProvider::from_env()?),
            ProviderType::Gemini => Arc::new(GeminiProvider::from_env()?),
            ProviderType::Ollama => Arc::new(OllamaProvider::from_env()?),
            ProviderType::LMStudio => Arc::new(LMStudioProvider::from_env()?),
        })
    }

    fn finish<P: LLMProvider + 'static>(provider: P, tracing: bool) -> Arc<dyn LLMProvider> {
        if tracing {
            Arc::new(TracingProvider::new(provider))
        } else {
            Arc::new(provider)
        }
    }

    fn require_key(provider_type: ProviderType, credential: Option<String>) -> Result<String> {
        credential.ok_or_else(|| {
            LlmError::ConfigError(format!(
                "{} requires an API key; pass a credential or set {}",
                provider_type,
                provider_type.default_api_key_envs().join(" or ")
            ))
        })
    }

    fn anthropic(
        settings: &ProviderSettings,
        credential: Option<String>,
    ) -> Result<AnthropicProvider> {
        let mut provider =
            AnthropicProvider::new(Self::require_key(ProviderType::Anthropic, credential)?);
        if let Some(model) = settings.model() {
            provider = provider.with_model(model);
        }
        if let Some(url) = settings.resolved_base_url() {
            provider = provider.with_base_url(url);
        }
        if let Some(timeout) = settings.timeout() {
            provider = provider.with_timeout(timeout);
        }
        Ok(provider)
    }

    fn openai(settings: &ProviderSettings, credential: Option<String>) -> Result<OpenAIProvider> {
        let mut provider =
            OpenAIProvider::new(Self::require_key(ProviderType::OpenAI, credential)?);
        if let Some(model) = settings.model() {
            provider = provider.with_model(model);
        }
        if let Some(url) = settings.resolved_base_url() {
            provider = provider.with_base_url(url);
        }
        if let Some(timeout) = settings.timeout() {
            provider = provider.with_timeout(timeout);
        }
        Ok(provider)
    }

    fn gemini(settings: &ProviderSettings, credential: Option<String>) -> Result<GeminiProvider> {
        let mut provider =
            GeminiProvider::new(Self::require_key(ProviderType::Gemini, credential)?);
        if let Some(model) = settings.model() {
            provider = provider.with_model(model);
        }
        if let Some(url) = settings.resolved_base_url() {
            provider = provider.with_base_url(url);
        }
        if let Some(timeout) = settings.timeout() {
            provider = provider.with_timeout(timeout);
        }
        Ok(provider)
    }

    fn ollama(settings: &ProviderSettings) -> Result<OllamaProvider> {
        let mut builder = OllamaProvider::builder();
        if let Some(host) = settings.resolved_base_url() {
            builder = builder.host(host);
        }
        if let Some(model) = settings.model() {
            builder = builder.model(model);
        }
        if let Some(timeout) = settings.timeout() {
            builder = builder.timeout(timeout);
        }
        if let Some(capacity) = settings.metrics_capacity {
            builder = builder.metrics_capacity(capacity);
        }
        builder.build()
    }

    fn lmstudio(
        settings: &ProviderSettings,
        credential: Option<String>,
    ) -> Result<LMStudioProvider> {
        let mut builder = LMStudioProvider::builder();
        if let Some(host) = settings.resolved_base_url() {
            builder = builder.host(host);
        }
        if let Some(model) = settings.model() {
            builder = builder.model(model);
        }
        if let Some(key) = credential {
            builder = builder.api_key(key);
        }
        if let Some(framing) = settings.framing {
            builder = builder.framing(framing);
        }
        if let Some(kind) = settings.backend_kind {
            builder = builder.backend_kind(kind);
        }
        if let Some(timeout) = settings.timeout() {
            builder = builder.timeout(timeout);
        }
        if let Some(capacity) = settings.metrics_capacity {
            builder = builder.metrics_capacity(capacity);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Framing;
    use serial_test::serial;

    #[test]
    fn test_provider_type_from_str() {
        assert_eq!("anthropic".parse::<ProviderType>().unwrap(), ProviderType::Anthropic);
        assert_eq!("Claude".parse::<ProviderType>().unwrap(), ProviderType::Anthropic);
        assert_eq!("OPENAI".parse::<ProviderType>().unwrap(), ProviderType::OpenAI);
        assert_eq!("google".parse::<ProviderType>().unwrap(), ProviderType::Gemini);
        assert_eq!("ollama".parse::<ProviderType>().unwrap(), ProviderType::Ollama);
        assert_eq!("lm-studio".parse::<ProviderType>().unwrap(), ProviderType::LMStudio);
        assert_eq!(" lmstudio ".parse::<ProviderType>().unwrap(), ProviderType::LMStudio);
    }

    #[test]
    fn test_provider_type_rejects_unknown() {
        let err = "openrouter".parse::<ProviderType>().unwrap_err();
        assert!(matches!(err, LlmError::ConfigError(msg) if msg.contains("openrouter")));
    }

    #[test]
    fn test_provider_type_display_matches_name() {
        for provider_type in ProviderType::ALL {
            let parsed: ProviderType = provider_type.to_string().parse().unwrap();
            assert_eq!(parsed, provider_type);
        }
        assert!(ProviderType::Ollama.is_local());
        assert!(!ProviderType::Gemini.is_local());
    }

    #[test]
    fn test_create_with_explicit_credential() {
        let settings = ProviderSettings::new(ProviderType::Anthropic).with_model("claude-x");
        let provider = ProviderFactory::create(&settings, Some("sk-test".into())).unwrap();
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.model(), "claude-x");
    }

    #[test]
    #[serial]
    fn test_create_cloud_without_key_fails() {
        std::env::remove_var("OPENAI_API_KEY");
        let settings = ProviderSettings::new(ProviderType::OpenAI);
        let err = ProviderFactory::create(&settings, None).err().unwrap();
        assert!(matches!(err, LlmError::ConfigError(msg) if msg.contains("OPENAI_API_KEY")));
    }

    #[test]
    #[serial]
    fn test_create_reads_custom_key_env() {
        std::env::set_var("SWITCHYARD_TEST_GEMINI_KEY", "g-key");
        let mut settings = ProviderSettings::new(ProviderType::Gemini);
        settings.api_key_env = Some("SWITCHYARD_TEST_GEMINI_KEY".into());
        let provider = ProviderFactory::create(&settings, None).unwrap();
        assert_eq!(provider.name(), "gemini");
        std::env::remove_var("SWITCHYARD_TEST_GEMINI_KEY");
    }

    #[test]
    fn test_create_local_providers() {
        let ollama = ProviderFactory::create(
            &ProviderSettings::new(ProviderType::Ollama).with_model("qwen2.5:7b"),
            None,
        )
        .unwrap();
        assert_eq!(ollama.name(), "ollama");
        assert_eq!(ollama.model(), "qwen2.5:7b");
        assert!(ollama.capabilities().local);

        let mut settings = ProviderSettings::new(ProviderType::LMStudio)
            .with_base_url("http://127.0.0.1:8080/v1");
        settings.framing = Some(Framing::ChunkedText);
        let lmstudio = ProviderFactory::create(&settings, None).unwrap();
        assert_eq!(lmstudio.name(), "lmstudio");
        assert_eq!(lmstudio.capabilities().framing, Framing::ChunkedText);
    }

    #[test]
    fn test_create_with_tracing_keeps_identity() {
        let mut settings = ProviderSettings::new(ProviderType::Ollama);
        settings.tracing = true;
        let provider = ProviderFactory::create(&settings, None).unwrap();
        assert_eq!(provider.name(), "ollama");
        assert_eq!(provider.capabilities().id, "ollama");
    }

    #[test]
    fn test_create_rejects_invalid_settings() {
        let mut settings = ProviderSettings::new(ProviderType::LMStudio);
        settings.framing = Some(Framing::Ndjson);
        assert!(ProviderFactory::create(&settings, None).is_err());
    }

    #[tokio::test]
    async fn test_create_supervised_local() {
        let mut settings = ProviderSettings::new(ProviderType::Ollama)
            .with_base_url("http://127.0.0.1:1");
        settings.health_interval_seconds = Some(60);
        let cancel = CancellationToken::new();
        let provider =
            ProviderFactory::create_supervised(&settings, None, cancel.clone()).unwrap();
        assert_eq!(provider.name(), "ollama");
        cancel.cancel();
    }

    #[test]
    #[serial]
    fn test_from_env_explicit_selection() {
        std::env::set_var("SWITCHYARD_PROVIDER", "ollama");
        let provider = ProviderFactory::from_env().unwrap();
        assert_eq!(provider.name(), "ollama");

        std::env::set_var("SWITCHYARD_PROVIDER", "bogus");
        assert!(ProviderFactory::from_env().is_err());
        std::env::remove_var("SWITCHYARD_PROVIDER");
    }

    #[test]
    #[serial]
    fn test_from_env_auto_detects_lmstudio() {
        for var in [
            "SWITCHYARD_PROVIDER",
            "OLLAMA_HOST",
            "OLLAMA_MODEL",
            "LMSTUDIO_MODEL",
        ] {
            std::env::remove_var(var);
        }
        std::env::set_var("LMSTUDIO_HOST", "http://localhost:1234");
        let provider = ProviderFactory::from_env().unwrap();
        assert_eq!(provider.name(), "lmstudio");
        std::env::remove_var("LMSTUDIO_HOST");
    }
}
