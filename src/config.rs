//! TOML-backed provider settings.
//!
//! # Configuration File Location
//!
//! [`SettingsFile::load`] looks in order at:
//! 1. `SWITCHYARD_CONFIG` environment variable
//! 2. `./switchyard.toml` (current working directory)
//! 3. an empty file (no providers)
//!
//! # Example Configuration
//!
//! ```toml
//! default = "local"
//!
//! [[providers]]
//! name = "local"
//! type = "ollama"
//! base_url = "http://localhost:11434"
//! model = "qwen2.5:7b"
//! metrics_capacity = 200
//! health_interval_seconds = 30
//!
//! [[providers]]
//! name = "claude"
//! type = "anthropic"
//! api_key_env = "ANTHROPIC_API_KEY"
//! model = "claude-sonnet-4-5-20250929"
//! timeout_seconds = 60
//! tracing = true
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LlmError, Result};
use crate::factory::ProviderType;
use crate::health::BackendKind;
use crate::types::Framing;

const CONFIG_ENV: &str = "SWITCHYARD_CONFIG";
const LOCAL_CONFIG_FILE: &str = "switchyard.toml";

/// Everything needed to build one adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Local handle for this entry; defaults to the provider type id.
    #[serde(default)]
    pub name: String,

    #[serde(rename = "type")]
    pub provider_type: ProviderType,

    /// Default model; the adapter's own default when unset.
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable that overrides `base_url` when set.
    #[serde(default)]
    pub base_url_env: Option<String>,

    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Server software behind a local base URL (LM Studio adapter only).
    #[serde(default)]
    pub backend_kind: Option<BackendKind>,

    /// Streaming framing (LM Studio adapter only).
    #[serde(default)]
    pub framing: Option<Framing>,

    /// Request timeout for non-streaming calls; zero means the adapter default.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Ring buffer size of the local metrics tracker.
    #[serde(default)]
    pub metrics_capacity: Option<usize>,

    /// Period of background health probes for local backends.
    #[serde(default)]
    pub health_interval_seconds: Option<u64>,

    /// Wrap the adapter in a GenAI tracing decorator.
    #[serde(default)]
    pub tracing: bool,
}

impl ProviderSettings {
    pub fn new(provider_type: ProviderType) -> Self {
        Self {
            name: provider_type.as_str().to_string(),
            provider_type,
            model: None,
            base_url: None,
            base_url_env: None,
            api_key_env: None,
            backend_kind: None,
            framing: None,
            timeout_seconds: None,
            metrics_capacity: None,
            health_interval_seconds: None,
            tracing: false,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.tracing = enabled;
        self
    }

    /// Configured model, ignoring blank strings.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref().filter(|m| !m.trim().is_empty())
    }

    /// Base URL after applying the `base_url_env` override.
    pub fn resolved_base_url(&self) -> Option<String> {
        self.base_url_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|url| !url.is_empty())
            .or_else(|| self.base_url.clone().filter(|url| !url.is_empty()))
    }

    pub fn timeout(&self) -> Option<Duration> {
        seconds(self.timeout_seconds)
    }

    pub fn health_interval(&self) -> Option<Duration> {
        seconds(self.health_interval_seconds)
    }

    /// API key from `api_key_env`, else from the provider's default variables.
    pub fn credential_from_env(&self) -> Option<String> {
        let read = |var: &str| std::env::var(var).ok().filter(|v| !v.is_empty());
        match &self.api_key_env {
            Some(var) => read(var),
            None => self
                .provider_type
                .default_api_key_envs()
                .iter()
                .find_map(|var| read(var)),
        }
    }

    /// Reject combinations the target adapter cannot honor.
    pub fn validate(&self) -> Result<()> {
        if let Some(framing) = self.framing {
            let allowed = match self.provider_type {
                ProviderType::LMStudio => framing != Framing::Ndjson,
                ProviderType::Ollama => framing == Framing::Ndjson,
                _ => framing == Framing::Sse,
            };
            if !allowed {
                return Err(LlmError::ConfigError(format!(
                    "provider '{}' cannot stream with {:?} framing",
                    self.name, framing
                )));
            }
        }
        if self.metrics_capacity == Some(0) {
            return Err(LlmError::ConfigError(format!(
                "provider '{}': metrics_capacity must be at least 1",
                self.name
            )));
        }
        if self.backend_kind.is_some() && self.provider_type != ProviderType::LMStudio {
            tracing::warn!(
                provider = %self.name,
                "backend_kind only applies to lmstudio; ignoring"
            );
        }
        Ok(())
    }
}

/// Root of `switchyard.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsFile {
    /// Name of the entry used by [`SettingsFile::default_provider`].
    #[serde(default)]
    pub default: Option<String>,

    #[serde(default)]
    pub providers: Vec<ProviderSettings>,
}

impl SettingsFile {
    /// Load from `SWITCHYARD_CONFIG`, then `./switchyard.toml`, else empty.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if Path::new(&path).exists() {
                return Self::from_file(&path);
            }
            tracing::warn!(path = %path, "{} points at a missing file", CONFIG_ENV);
        }

        let local_path = Path::new(LOCAL_CONFIG_FILE);
        if local_path.exists() {
            return Self::from_file(local_path);
        }

        Ok(Self::default())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            LlmError::ConfigError(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut file: SettingsFile = toml::from_str(toml_str)
            .map_err(|e| LlmError::ConfigError(format!("failed to parse TOML config: {}", e)))?;
        for entry in &mut file.providers {
            if entry.name.is_empty() {
                entry.name = entry.provider_type.as_str().to_string();
            }
        }
        file.validate()?;
        Ok(file)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LlmError::ConfigError(format!("failed to serialize config: {}", e)))
    }

    pub fn get(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// The `default` entry, or the only entry when there is exactly one.
    pub fn default_provider(&self) -> Option<&ProviderSettings> {
        match &self.default {
            Some(name) => self.get(name),
            None if self.providers.len() == 1 => self.providers.first(),
            None => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(LlmError::ConfigError(format!(
                    "duplicate provider name: '{}'",
                    provider.name
                )));
            }
            provider.validate()?;
        }
        if let Some(name) = &self.default {
            if self.get(name).is_none() {
                return Err(LlmError::ConfigError(format!(
                    "default provider '{}' not found in providers list",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn seconds(value: Option<u64>) -> Option<Duration> {
    value.filter(|s| *s > 0).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const SAMPLE: &str = r#"
default = "local"

[[providers]]
name = "local"
type = "ollama"
base_url = "http://localhost:11434"
model = "qwen2.5:7b"
metrics_capacity = 200
health_interval_seconds = 30

[[providers]]
type = "claude"
api_key_env = "MY_CLAUDE_KEY"
timeout_seconds = 60
tracing = true

[[providers]]
name = "llamacpp"
type = "lm-studio"
base_url = "http://localhost:8080"
backend_kind = "llamacpp"
framing = "chunked_text"
"#;

    #[test]
    fn test_parse_sample() {
        let file = SettingsFile::from_toml(SAMPLE).unwrap();
        assert_eq!(file.providers.len(), 3);

        let local = file.default_provider().unwrap();
        assert_eq!(local.provider_type, ProviderType::Ollama);
        assert_eq!(local.model(), Some("qwen2.5:7b"));
        assert_eq!(local.health_interval(), Some(Duration::from_secs(30)));
        assert_eq!(local.metrics_capacity, Some(200));

        let claude = file.get("anthropic").unwrap();
        assert_eq!(claude.timeout(), Some(Duration::from_secs(60)));
        assert!(claude.tracing);

        let llamacpp = file.get("llamacpp").unwrap();
        assert_eq!(llamacpp.provider_type, ProviderType::LMStudio);
        assert_eq!(llamacpp.backend_kind, Some(BackendKind::LlamaCpp));
        assert_eq!(llamacpp.framing, Some(Framing::ChunkedText));
    }

    #[test]
    fn test_toml_roundtrip() {
        let file = SettingsFile::from_toml(SAMPLE).unwrap();
        let parsed = SettingsFile::from_toml(&file.to_toml().unwrap()).unwrap();
        assert_eq!(file, parsed);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let toml = r#"
[[providers]]
type = "ollama"

[[providers]]
type = "ollama"
"#;
        let err = SettingsFile::from_toml(toml).unwrap_err();
        assert!(matches!(err, LlmError::ConfigError(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_unknown_default_rejected() {
        let toml = r#"
default = "missing"

[[providers]]
type = "openai"
"#;
        assert!(SettingsFile::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_provider_type_rejected() {
        let toml = r#"
[[providers]]
type = "mock"
"#;
        assert!(SettingsFile::from_toml(toml).is_err());
    }

    #[test]
    fn test_single_entry_is_default() {
        let file = SettingsFile::from_toml("[[providers]]\ntype = \"gemini\"\n").unwrap();
        assert_eq!(file.default_provider().unwrap().name, "gemini");
        assert!(SettingsFile::default().default_provider().is_none());
    }

    #[test]
    fn test_framing_validation() {
        let mut settings = ProviderSettings::new(ProviderType::LMStudio);
        settings.framing = Some(Framing::Ndjson);
        assert!(settings.validate().is_err());

        settings.framing = Some(Framing::ChunkedText);
        assert!(settings.validate().is_ok());

        let mut anthropic = ProviderSettings::new(ProviderType::Anthropic);
        anthropic.framing = Some(Framing::ChunkedText);
        assert!(anthropic.validate().is_err());
    }

    #[test]
    fn test_zero_values_mean_unset() {
        let mut settings = ProviderSettings::new(ProviderType::Ollama);
        settings.timeout_seconds = Some(0);
        settings.health_interval_seconds = Some(0);
        assert_eq!(settings.timeout(), None);
        assert_eq!(settings.health_interval(), None);

        settings.metrics_capacity = Some(0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_blank_model_ignored() {
        let settings = ProviderSettings::new(ProviderType::OpenAI).with_model("  ");
        assert_eq!(settings.model(), None);
    }

    #[test]
    #[serial]
    fn test_base_url_env_override() {
        let mut settings =
            ProviderSettings::new(ProviderType::Ollama).with_base_url("http://a:11434");
        settings.base_url_env = Some("SWITCHYARD_TEST_OLLAMA_URL".into());

        std::env::remove_var("SWITCHYARD_TEST_OLLAMA_URL");
        assert_eq!(settings.resolved_base_url().as_deref(), Some("http://a:11434"));

        std::env::set_var("SWITCHYARD_TEST_OLLAMA_URL", "http://b:11434");
        assert_eq!(settings.resolved_base_url().as_deref(), Some("http://b:11434"));
        std::env::remove_var("SWITCHYARD_TEST_OLLAMA_URL");
    }

    #[test]
    #[serial]
    fn test_credential_lookup_order() {
        std::env::remove_var("GEMINI_API_KEY");
        std::env::set_var("GOOGLE_API_KEY", "google-key");
        let settings = ProviderSettings::new(ProviderType::Gemini);
        assert_eq!(settings.credential_from_env().as_deref(), Some("google-key"));

        std::env::set_var("GEMINI_API_KEY", "gemini-key");
        assert_eq!(settings.credential_from_env().as_deref(), Some("gemini-key"));

        std::env::remove_var("GEMINI_API_KEY");
        std::env::remove_var("GOOGLE_API_KEY");
        assert_eq!(settings.credential_from_env(), None);
        assert_eq!(
            ProviderSettings::new(ProviderType::Ollama).credential_from_env(),
            None
        );
    }

    #[test]
    #[serial]
    fn test_load_from_env_path() {
        let path = std::env::temp_dir().join(format!("switchyard-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, SAMPLE).unwrap();
        std::env::set_var(CONFIG_ENV, &path);
        let file = SettingsFile::load().unwrap();
        assert_eq!(file.providers.len(), 3);
        std::env::remove_var(CONFIG_ENV);
        std::fs::remove_file(&path).unwrap();
    }
}
