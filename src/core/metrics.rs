//! Prometheus metrics for the proxy.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounter,
    IntCounterVec, IntGaugeVec, TextEncoder,
};

lazy_static! {
    pub static ref PROXY_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "proxy_requests_total",
        "Proxied requests by service, model family, and outcome",
        &["service", "family", "outcome"]
    )
    .unwrap();
    pub static ref PROXY_RETRIES: IntCounter = register_int_counter!(
        "proxy_retries_total",
        "Requests re-enqueued after an upstream 429"
    )
    .unwrap();
    pub static ref QUEUE_DEPTH: IntGaugeVec = register_int_gauge_vec!(
        "proxy_queue_depth",
        "Requests currently waiting for a key, by shard",
        &["service", "family"]
    )
    .unwrap();
    pub static ref TOKENS_CONSUMED: IntCounterVec = register_int_counter_vec!(
        "proxy_tokens_consumed_total",
        "Tokens charged against user quotas, by family",
        &["family"]
    )
    .unwrap();
}

/// Force metric registration at startup so `/metrics` is complete before the
/// first request.
pub fn init_metrics() {
    lazy_static::initialize(&PROXY_REQUESTS);
    lazy_static::initialize(&PROXY_RETRIES);
    lazy_static::initialize(&QUEUE_DEPTH);
    lazy_static::initialize(&TOKENS_CONSUMED);
}

/// Render the default registry in the Prometheus text format.
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        init_metrics();
        PROXY_REQUESTS
            .with_label_values(&["openai", "turbo", "ok"])
            .inc();
        let rendered = render_metrics();
        assert!(rendered.contains("proxy_requests_total"));
    }
}
