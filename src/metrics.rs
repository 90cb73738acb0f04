//! Prometheus metrics, exported on the admin listener's /metrics route.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref DNS_REQUESTS_TOTAL: IntCounter = register_int_counter!(
        "relaydns_dns_requests_total",
        "Counter of DNS requests received over UDP."
    )
    .unwrap();

    pub static ref DNS_RESPONSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "relaydns_dns_responses_total",
        "Counter of DNS responses by response code.",
        &["rcode"]
    )
    .unwrap();

    pub static ref STORE_HITS_TOTAL: IntCounter = register_int_counter!(
        "relaydns_store_hits_total",
        "The count of lookups answered from the record store."
    )
    .unwrap();

    pub static ref STORE_MISSES_TOTAL: IntCounter = register_int_counter!(
        "relaydns_store_misses_total",
        "The count of lookups the record store could not answer."
    )
    .unwrap();

    pub static ref STORE_ENTRIES: IntGauge = register_int_gauge!(
        "relaydns_store_entries",
        "The number of records currently held by the store."
    )
    .unwrap();

    pub static ref UPSTREAM_REQUEST_DURATION: Histogram = register_histogram!(
        "relaydns_upstream_request_duration_seconds",
        "Histogram of the time each forwarded exchange took.",
        vec![0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048,
            4.096, 8.192]
    )
    .unwrap();

    pub static ref UPSTREAM_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "relaydns_upstream_failures_total",
        "Counter of forwarded exchanges that failed or timed out."
    )
    .unwrap();

    pub static ref ADMIN_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "relaydns_admin_requests_total",
        "Counter of admin operations by kind.",
        &["op"]
    )
    .unwrap();
}

/// Renders the default registry in the Prometheus text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
