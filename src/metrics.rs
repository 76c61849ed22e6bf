//! Latency and throughput samples for local backends.
//!
//! ## Architecture
//!
//! ```text
//! chat()/stream() ──► InferenceTimer ──► PerformanceMetrics ──► MetricsTracker (ring)
//!                     - first token        {model, latency,        - average()
//!                     - output tokens       tokens/s, time}        - average_for_model()
//!                                                                  - recent(n)
//! ```
//!
//! The tracker keeps a fixed number of samples. Once full, each new sample
//! overwrites the oldest one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::traits::EventStream;
use crate::types::StreamEvent;

/// Default number of retained samples.
pub const DEFAULT_METRICS_CAPACITY: usize = 100;

/// One completed inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub model_id: String,
    pub latency_ms: f64,
    pub tokens_per_second: f64,
    pub timestamp: DateTime<Utc>,
}

/// Mean latency and throughput over a set of samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub samples: usize,
    pub avg_latency_ms: f64,
    pub avg_tokens_per_second: f64,
}

/// Fixed-capacity ring with overwrite-oldest semantics.
#[derive(Debug)]
struct Ring {
    slots: Vec<PerformanceMetrics>,
    capacity: usize,
    /// Index the next sample is written to once `slots` is full.
    next: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    fn push(&mut self, sample: PerformanceMetrics) {
        if self.slots.len() < self.capacity {
            self.slots.push(sample);
        } else {
            self.slots[self.next] = sample;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    /// Samples from newest to oldest.
    fn newest_first(&self) -> impl Iterator<Item = &PerformanceMetrics> {
        let len = self.slots.len();
        let newest = (self.next + self.capacity - 1) % self.capacity;
        (0..len).map(move |i| &self.slots[(newest + len - i) % len])
    }
}

fn summarize<'a>(samples: impl Iterator<Item = &'a PerformanceMetrics>) -> Option<MetricsSummary> {
    let (mut n, mut latency, mut tps) = (0usize, 0.0f64, 0.0f64);
    for s in samples {
        n += 1;
        latency += s.latency_ms;
        tps += s.tokens_per_second;
    }
    (n > 0).then(|| MetricsSummary {
        samples: n,
        avg_latency_ms: latency / n as f64,
        avg_tokens_per_second: tps / n as f64,
    })
}

/// Bounded rolling window of samples owned by one adapter instance.
#[derive(Debug)]
pub struct MetricsTracker {
    ring: Mutex<Ring>,
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS_CAPACITY)
    }
}

impl MetricsTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring::new(capacity)),
        }
    }

    pub async fn record(&self, sample: PerformanceMetrics) {
        self.ring.lock().await.push(sample);
    }

    pub async fn len(&self) -> usize {
        self.ring.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn capacity(&self) -> usize {
        self.ring.lock().await.capacity
    }

    /// Average over every retained sample.
    pub async fn average(&self) -> Option<MetricsSummary> {
        let ring = self.ring.lock().await;
        summarize(ring.slots.iter())
    }

    /// Average over retained samples for one model.
    pub async fn average_for_model(&self, model_id: &str) -> Option<MetricsSummary> {
        let ring = self.ring.lock().await;
        summarize(ring.slots.iter().filter(|s| s.model_id == model_id))
    }

    /// Up to `n` most recent samples, newest first.
    pub async fn recent(&self, n: usize) -> Vec<PerformanceMetrics> {
        let ring = self.ring.lock().await;
        ring.newest_first().take(n).cloned().collect()
    }
}

// ============================================================================
// Timing
// ============================================================================

/// Measures one inference from request start.
#[derive(Debug, Clone)]
pub struct InferenceTimer {
    request_start: Instant,
    first_token_time: Option<Instant>,
    chars_received: usize,
}

impl Default for InferenceTimer {
    fn default() -> Self {
        Self::start()
    }
}

impl InferenceTimer {
    pub fn start() -> Self {
        Self {
            request_start: Instant::now(),
            first_token_time: None,
            chars_received: 0,
        }
    }

    /// Record arrival of streamed text. Only the first call sets time-to-first-token.
    pub fn record_text(&mut self, text: &str) {
        if self.first_token_time.is_none() {
            self.first_token_time = Some(Instant::now());
        }
        self.chars_received += text.chars().count();
    }

    pub fn elapsed(&self) -> Duration {
        self.request_start.elapsed()
    }

    /// Time to first token in milliseconds, if any text arrived.
    pub fn ttft_ms(&self) -> Option<f64> {
        self.first_token_time
            .map(|ft| ft.duration_since(self.request_start).as_secs_f64() * 1000.0)
    }

    /// Output tokens per second over the whole request.
    ///
    /// `output_tokens == 0` falls back to an estimate from received text.
    pub fn tokens_per_second(&self, output_tokens: u64) -> f64 {
        let tokens = if output_tokens > 0 {
            output_tokens
        } else {
            (self.chars_received as u64).div_ceil(crate::usage::CHARS_PER_TOKEN as u64)
        };
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 || tokens == 0 {
            return 0.0;
        }
        tokens as f64 / secs
    }

    /// Close the measurement into a sample.
    pub fn finish(&self, model_id: impl Into<String>, output_tokens: u64) -> PerformanceMetrics {
        PerformanceMetrics {
            model_id: model_id.into(),
            latency_ms: self.elapsed().as_secs_f64() * 1000.0,
            tokens_per_second: self.tokens_per_second(output_tokens),
            timestamp: Utc::now(),
        }
    }
}

/// Record a sample into `tracker` when `stream` reaches a successful `done`.
///
/// Events pass through unchanged. Failed or cancelled streams record nothing.
pub fn instrument_stream(
    stream: EventStream,
    tracker: Arc<MetricsTracker>,
    model_id: String,
) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut timer = InferenceTimer::start();
        let mut failed = false;
        let mut stream = stream;

        while let Some(event) = stream.next().await {
            match &event {
                StreamEvent::Token { content } => timer.record_text(content),
                StreamEvent::Error { .. } => failed = true,
                StreamEvent::Done { usage, .. } if !failed => {
                    let sample = timer.finish(model_id.clone(), usage.output_tokens);
                    tracing::debug!(
                        model = %model_id,
                        latency_ms = sample.latency_ms,
                        tokens_per_second = sample.tokens_per_second,
                        ttft_ms = ?timer.ttft_ms(),
                        "stream finished"
                    );
                    tracker.record(sample).await;
                }
                _ => {}
            }
            yield event;
        }
    })
}
