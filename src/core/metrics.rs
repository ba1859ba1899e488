//! Prometheus metrics for monitoring the gateway.
//!
//! This module provides a centralized metrics registry with various metric types
//! for tracking requests, latency, token usage, and upstream health.

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of requests by endpoint, capability, upstream, and status
    pub request_count: IntCounterVec,

    /// Request duration histogram in seconds
    pub request_duration: HistogramVec,

    /// Total token usage by model, upstream, and token category
    pub token_usage: IntCounterVec,

    /// Failover attempts by upstream and error type
    pub failover_attempts: IntCounterVec,

    /// Circuit breaker state per upstream (0=closed, 1=open, 2=half_open)
    pub circuit_state: GaugeVec,

    /// Time to first byte histogram in seconds for streaming responses
    pub ttft: HistogramVec,

    /// Billed cost in USD by model and upstream
    pub billed_cost_usd: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// This should be called once at application startup. Subsequent calls will
/// return the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "llm_gateway_requests_total",
            "Total number of requests",
            &["endpoint", "capability", "upstream", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "llm_gateway_request_duration_seconds",
            "Request duration in seconds",
            &["endpoint", "capability", "upstream"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register request_duration metric");

        let token_usage = register_int_counter_vec!(
            "llm_gateway_token_usage_total",
            "Total token usage",
            &["model", "upstream", "category"]
        )
        .expect("Failed to register token_usage metric");

        let failover_attempts = register_int_counter_vec!(
            "llm_gateway_failover_attempts_total",
            "Failover attempts by error type",
            &["upstream", "error_type"]
        )
        .expect("Failed to register failover_attempts metric");

        let circuit_state = register_gauge_vec!(
            "llm_gateway_circuit_state",
            "Circuit breaker state (0=closed, 1=open, 2=half_open)",
            &["upstream"]
        )
        .expect("Failed to register circuit_state metric");

        let ttft = register_histogram_vec!(
            "llm_gateway_ttft_seconds",
            "Time to first byte for streaming responses",
            &["model", "upstream"],
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
        )
        .expect("Failed to register ttft metric");

        let billed_cost_usd = register_histogram_vec!(
            "llm_gateway_billed_cost_usd",
            "Billed cost per request in USD",
            &["model", "upstream"],
            vec![0.0001, 0.001, 0.01, 0.1, 1.0, 10.0]
        )
        .expect("Failed to register billed_cost_usd metric");

        Metrics {
            request_count,
            request_duration,
            token_usage,
            failover_attempts,
            circuit_state,
            ttft,
            billed_cost_usd,
        }
    })
}

/// Get the metrics registry, initializing it if needed.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}

/// Render all registered metrics in the Prometheus text format.
pub fn render_metrics() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
