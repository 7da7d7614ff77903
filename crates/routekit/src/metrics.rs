//! Prometheus metrics for the interception pipeline.
//!
//! Tracks how requests are resolved, upstream fetches, applied overrides and
//! modifications, and failures caught at the dispatcher boundary.
use lazy_static::lazy_static;
use prometheus::{register_counter_vec, CounterVec, Encoder, TextEncoder};

lazy_static! {
    /// Intercepted requests by how they were resolved
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "routekit_requests_total",
        "Total number of intercepted requests",
        &["outcome"]  // outcome: fulfilled|continued
    )
    .unwrap();

    /// Upstream round trips made on behalf of handlers
    pub static ref UPSTREAM_FETCHES_TOTAL: CounterVec = register_counter_vec!(
        "routekit_upstream_fetches_total",
        "Total number of upstream fetches made by the pipeline",
        &["result"]  // result: ok|error
    )
    .unwrap();

    /// Declarative overrides applied
    pub static ref OVERRIDES_APPLIED_TOTAL: CounterVec = register_counter_vec!(
        "routekit_overrides_applied_total",
        "Total number of override rules applied",
        &["type", "mode"]
    )
    .unwrap();

    /// Body modifications applied
    pub static ref MODIFICATIONS_TOTAL: CounterVec = register_counter_vec!(
        "routekit_modifications_total",
        "Total number of response bodies rewritten",
        &["kind", "result"]  // kind: json|js|html, result: applied|error
    )
    .unwrap();

    /// Failures caught at the dispatcher boundary
    pub static ref DISPATCH_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "routekit_dispatch_errors_total",
        "Total number of errors caught while dispatching requests",
        &["phase"]  // phase: pre|commit|post
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_request(outcome: &str) {
    REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_upstream_fetch(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    UPSTREAM_FETCHES_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_override(kind: &str, mode: &str) {
    OVERRIDES_APPLIED_TOTAL.with_label_values(&[kind, mode]).inc();
}

pub fn record_modification(kind: &str, applied: bool) {
    let result = if applied { "applied" } else { "error" };
    MODIFICATIONS_TOTAL.with_label_values(&[kind, result]).inc();
}

pub fn record_dispatch_error(phase: &str) {
    DISPATCH_ERRORS_TOTAL.with_label_values(&[phase]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_includes_recorded_counters() {
        record_request("fulfilled");
        record_upstream_fetch(true);
        let text = collect_metrics();
        assert!(text.contains("routekit_requests_total"));
        assert!(text.contains("routekit_upstream_fetches_total"));
    }
}
