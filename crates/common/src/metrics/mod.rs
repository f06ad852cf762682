//! Metrics and observability utilities
//!
//! Provides Prometheus metrics for the lookup pipeline
//! with standardized naming conventions.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use std::time::Instant;

/// Metrics prefix for all IntelForge metrics
pub const METRICS_PREFIX: &str = "intelforge";

/// Buckets for correlation cycle latency (in seconds).
/// Bot replies arrive in seconds, not milliseconds.
pub const CYCLE_BUCKETS: &[f64] = &[
    0.5,   // 500ms
    1.0,   // 1s
    2.5,   // 2.5s
    5.0,   // 5s
    10.0,  // 10s
    20.0,  // 20s
    30.0,  // 30s - default idle timeout
    60.0,  // 1m
    120.0, // 2m - default ceiling
    300.0, // 5m
];

/// Buckets for HTTP request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, // 1ms
    0.005, // 5ms
    0.010, // 10ms
    0.025, // 25ms
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    5.000, // 5s
    30.00, // 30s - synchronous lookup budget
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Lookup metrics
    describe_counter!(
        format!("{}_lookups_started_total", METRICS_PREFIX),
        Unit::Count,
        "Lookups accepted, by query type"
    );

    describe_counter!(
        format!("{}_lookups_finished_total", METRICS_PREFIX),
        Unit::Count,
        "Lookups reaching a terminal status"
    );

    describe_histogram!(
        format!("{}_lookup_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Creation-to-terminal lookup latency in seconds"
    );

    describe_counter!(
        format!("{}_lookups_reused_total", METRICS_PREFIX),
        Unit::Count,
        "Lookups answered from a recent ledger entry"
    );

    // Gateway metrics
    describe_histogram!(
        format!("{}_gateway_wait_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Time spent queued for the messaging session"
    );

    describe_gauge!(
        format!("{}_gateway_holders", METRICS_PREFIX),
        Unit::Count,
        "Current holders of the messaging session (0 or 1)"
    );

    describe_counter!(
        format!("{}_gateway_reconnects_total", METRICS_PREFIX),
        Unit::Count,
        "Messaging session (re)connect attempts"
    );

    describe_counter!(
        format!("{}_inbound_events_total", METRICS_PREFIX),
        Unit::Count,
        "Inbound bot events, by kind and disposition"
    );

    // Result metrics
    describe_counter!(
        format!("{}_materialization_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Artifacts that could not be persisted after a resolved reply"
    );

    describe_counter!(
        format!("{}_review_flags_total", METRICS_PREFIX),
        Unit::Count,
        "Replies that matched no detection rule"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

pub fn record_lookup_started(query_type: &str, bot_id: &str) {
    counter!(
        format!("{}_lookups_started_total", METRICS_PREFIX),
        "query_type" => query_type.to_string(),
        "bot" => bot_id.to_string()
    )
    .increment(1);
}

pub fn record_lookup_finished(query_type: &str, status: &str, duration_secs: f64) {
    counter!(
        format!("{}_lookups_finished_total", METRICS_PREFIX),
        "query_type" => query_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_lookup_duration_seconds", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .record(duration_secs);
}

pub fn record_lookup_reused(query_type: &str) {
    counter!(
        format!("{}_lookups_reused_total", METRICS_PREFIX),
        "query_type" => query_type.to_string()
    )
    .increment(1);
}

pub fn record_gateway_wait(wait_secs: f64) {
    histogram!(format!("{}_gateway_wait_seconds", METRICS_PREFIX)).record(wait_secs);
}

pub fn set_gateway_holders(holders: usize) {
    gauge!(format!("{}_gateway_holders", METRICS_PREFIX)).set(holders as f64);
}

pub fn record_gateway_reconnect(success: bool) {
    let outcome = if success { "success" } else { "error" };
    counter!(
        format!("{}_gateway_reconnects_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);
}

/// `disposition` is one of: progress, partial, terminal, ignored
pub fn record_inbound_event(kind: &str, disposition: &str) {
    counter!(
        format!("{}_inbound_events_total", METRICS_PREFIX),
        "kind" => kind.to_string(),
        "disposition" => disposition.to_string()
    )
    .increment(1);
}

pub fn record_materialization_failure() {
    counter!(format!("{}_materialization_failures_total", METRICS_PREFIX)).increment(1);
}

pub fn record_review_flag(bot_id: &str) {
    counter!(
        format!("{}_review_flags_total", METRICS_PREFIX),
        "bot" => bot_id.to_string()
    )
    .increment(1);
}
