//! Metrics collection for lmshim
//!
//! This module provides Prometheus metrics for predict and stream calls.
//! Updates are plain atomic operations and stay cheap on the token path.

use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics registry for lmshim
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub inference: InferenceMetrics,
}

/// Inference-related metrics
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Total number of predict requests
    pub requests_total: IntCounter,

    /// Total number of successful requests
    pub requests_success: IntCounter,

    /// Failed requests, labelled by error kind
    pub requests_failed: IntCounterVec,

    /// Request duration histogram
    pub request_duration: Histogram,

    /// Prompt length in tokens
    pub prompt_tokens: Histogram,

    /// Tokens generated total
    pub tokens_generated_total: IntCounter,

    /// Tokens per second
    pub tokens_per_second: Histogram,

    /// Current active requests
    pub active_requests: IntGauge,

    /// Streams whose generation thread is still running
    pub active_streams: IntGauge,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn register<C>(registry: &Registry, collector: C) -> C
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .expect("metric names are unique within the registry");
    collector
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("histogram options are valid")
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let requests_total = IntCounter::new(
            "lmshim_requests_total",
            "Total number of predict requests",
        )
        .expect("counter options are valid");

        let requests_success = IntCounter::new(
            "lmshim_requests_success_total",
            "Total number of successful predict requests",
        )
        .expect("counter options are valid");

        let requests_failed = IntCounterVec::new(
            Opts::new(
                "lmshim_requests_failed_total",
                "Total number of failed predict requests",
            ),
            &["kind"],
        )
        .expect("counter options are valid");

        let request_duration = histogram(
            "lmshim_request_duration_seconds",
            "Predict request duration in seconds",
            vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
        );

        let prompt_tokens = histogram(
            "lmshim_prompt_tokens",
            "Prompt length in tokens",
            vec![16.0, 64.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0],
        );

        let tokens_generated_total = IntCounter::new(
            "lmshim_tokens_generated_total",
            "Total number of tokens generated",
        )
        .expect("counter options are valid");

        let tokens_per_second = histogram(
            "lmshim_tokens_per_second",
            "Tokens generated per second",
            vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0],
        );

        let active_requests = IntGauge::new(
            "lmshim_active_requests",
            "Current number of active predict requests",
        )
        .expect("gauge options are valid");

        let active_streams = IntGauge::new(
            "lmshim_active_streams",
            "Current number of running stream producers",
        )
        .expect("gauge options are valid");

        let inference = InferenceMetrics {
            requests_total: register(&registry, requests_total),
            requests_success: register(&registry, requests_success),
            requests_failed: register(&registry, requests_failed),
            request_duration: register(&registry, request_duration),
            prompt_tokens: register(&registry, prompt_tokens),
            tokens_generated_total: register(&registry, tokens_generated_total),
            tokens_per_second: register(&registry, tokens_per_second),
            active_requests: register(&registry, active_requests),
            active_streams: register(&registry, active_streams),
        };

        MetricsRegistry {
            registry,
            inference,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
