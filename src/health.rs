//! Reachability probing for local inference servers.
//!
//! A [`HealthMonitor`] belongs to exactly one adapter instance. It probes a
//! short list of cheap endpoints for its [`BackendKind`], reports the first
//! success as available, and never returns an error. Listeners fire only when
//! the reported status or error text changes between checks.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Reachability of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Available,
    Unavailable,
    Unknown,
}

/// Snapshot of the last probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub last_checked: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProviderHealth {
    fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_checked: Utc::now(),
            latency_ms: None,
            error: None,
        }
    }

    fn differs_from(&self, other: &ProviderHealth) -> bool {
        self.status != other.status || self.error != other.error
    }
}

/// Server software behind a local base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ollama,
    LmStudio,
    LlamaCpp,
    Vllm,
    #[default]
    Generic,
}

impl BackendKind {
    /// Guess the backend from its base URL (port or host name).
    ///
    /// Only a fallback; adapters pass an explicit kind where they know it.
    pub fn detect(base_url: &str) -> Self {
        let url = base_url.to_ascii_lowercase();
        if url.contains("ollama") || url.contains(":11434") {
            BackendKind::Ollama
        } else if url.contains("lmstudio") || url.contains("lm-studio") || url.contains(":1234") {
            BackendKind::LmStudio
        } else if url.contains("vllm") || url.contains(":8000") {
            BackendKind::Vllm
        } else if url.contains("llama") || url.contains(":8080") {
            BackendKind::LlamaCpp
        } else {
            BackendKind::Generic
        }
    }

    /// Endpoints tried in order; the first 2xx wins.
    pub fn probe_paths(&self) -> &'static [&'static str] {
        match self {
            BackendKind::Ollama => &["/api/version", "/api/tags"],
            BackendKind::LmStudio => &["/v1/models", "/api/v0/models"],
            BackendKind::LlamaCpp => &["/health", "/v1/models"],
            BackendKind::Vllm => &["/health", "/v1/models"],
            BackendKind::Generic => &["/v1/models", "/health"],
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ollama" => Ok(BackendKind::Ollama),
            "lmstudio" | "lm-studio" | "lm_studio" => Ok(BackendKind::LmStudio),
            "llamacpp" | "llama.cpp" | "llama-cpp" => Ok(BackendKind::LlamaCpp),
            "vllm" => Ok(BackendKind::Vllm),
            "generic" | "openai-compatible" => Ok(BackendKind::Generic),
            other => Err(format!("unknown backend kind '{}'", other)),
        }
    }
}

/// Callback invoked with the new snapshot whenever health changes.
pub type HealthListener = Arc<dyn Fn(&ProviderHealth) + Send + Sync>;

/// Default per-probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodic reachability prober for one local backend.
pub struct HealthMonitor {
    client: Client,
    base_url: String,
    kind: BackendKind,
    probe_timeout: Duration,
    last: RwLock<ProviderHealth>,
    listeners: RwLock<Vec<HealthListener>>,
    /// Held for a whole check so a slow one cannot overwrite a newer result.
    check_lock: Mutex<()>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("base_url", &self.base_url)
            .field("kind", &self.kind)
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

impl HealthMonitor {
    /// Create a monitor. With `kind == None` the kind is guessed from `base_url`.
    pub fn new(client: Client, base_url: impl Into<String>, kind: Option<BackendKind>) -> Self {
        let base_url = base_url.into();
        let kind = kind.unwrap_or_else(|| BackendKind::detect(&base_url));
        Self {
            client,
            base_url,
            kind,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            last: RwLock::new(ProviderHealth::unknown()),
            listeners: RwLock::new(Vec::new()),
            check_lock: Mutex::new(()),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Server root: base URL without a trailing `/v1` or slash.
    fn root(&self) -> &str {
        let trimmed = self.base_url.trim_end_matches('/');
        trimmed.strip_suffix("/v1").unwrap_or(trimmed)
    }

    /// Register a listener for status/error changes.
    pub async fn subscribe(&self, listener: HealthListener) {
        self.listeners.write().await.push(listener);
    }

    /// Last reported snapshot (`unknown` before the first check).
    pub async fn last(&self) -> ProviderHealth {
        self.last.read().await.clone()
    }

    /// Probe now and publish the result. Concurrent checks run one at a time.
    pub async fn check(&self) -> ProviderHealth {
        let _serial = self.check_lock.lock().await;
        let started = Instant::now();
        let mut failure = None;
        let mut reachable = false;

        for path in self.kind.probe_paths() {
            let url = format!("{}{}", self.root(), path);
            match self
                .client
                .get(&url)
                .timeout(self.probe_timeout)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    reachable = true;
                    break;
                }
                Ok(resp) => failure = Some(format!("{} returned HTTP {}", path, resp.status())),
                Err(e) => failure = Some(format!("{} unreachable: {}", path, e)),
            }
        }

        let health = if reachable {
            ProviderHealth {
                status: HealthStatus::Available,
                last_checked: Utc::now(),
                latency_ms: Some(started.elapsed().as_millis() as u64),
                error: None,
            }
        } else {
            ProviderHealth {
                status: HealthStatus::Unavailable,
                last_checked: Utc::now(),
                latency_ms: None,
                error: failure,
            }
        };

        self.publish(health.clone()).await;
        health
    }

    async fn publish(&self, health: ProviderHealth) {
        let changed = {
            let mut last = self.last.write().await;
            let changed = health.differs_from(&last);
            *last = health.clone();
            changed
        };

        if changed {
            debug!(
                base_url = %self.base_url,
                status = ?health.status,
                error = health.error.as_deref().unwrap_or(""),
                "backend health changed"
            );
            let listeners = self.listeners.read().await.clone();
            for listener in listeners {
                listener(&health);
            }
        }
    }

    /// Probe on a fixed interval until `cancel` fires.
    pub fn spawn_periodic(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let health = self.check().await;
                        if health.status == HealthStatus::Unavailable {
                            warn!(base_url = %self.base_url, error = ?health.error, "backend unavailable");
                        }
                    }
                }
            }
        })
    }
}
