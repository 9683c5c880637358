// Metrics and observability module
// This file registers the Prometheus metrics for the data plane, the setup
// control plane and the RPC calls between them
//
// Numan Thabit 2025 Nov

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, HistogramVec,
    IntGauge,
};

/// Packets handled by the router transport loop, by action (forward/consume/drop).
pub static PACKETS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "meshroute_packets_total",
        "data packets handled by the router",
        &["action"]
    )
    .expect("register meshroute_packets_total")
});

/// DialRouteGroup requests on the setup node, by outcome.
pub static SETUP_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "meshroute_setup_requests_total",
        "route group setup requests",
        &["outcome"]
    )
    .expect("register meshroute_setup_requests_total")
});

pub static RPC_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "meshroute_rpc_latency_seconds",
        "latency of setup rpc calls",
        &["method"]
    )
    .expect("register meshroute_rpc_latency_seconds")
});

pub static RPC_ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "meshroute_rpc_errors_total",
        "failed setup rpc calls",
        &["method"]
    )
    .expect("register meshroute_rpc_errors_total")
});

pub static ROUTING_RULES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "meshroute_routing_rules",
        "rules in the routing table after the last cleanup"
    )
    .expect("register meshroute_routing_rules")
});

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> String {
    use prometheus::Encoder;
    let mut buf = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    if encoder.encode(&prometheus::gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
