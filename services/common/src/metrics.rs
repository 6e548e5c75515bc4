//! Prometheus metrics utilities

use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounter,
    IntCounterVec, IntGaugeVec, TextEncoder,
};

lazy_static::lazy_static! {
    /// Classifier outcomes, advanced by the reporter from per-CPU counter deltas
    pub static ref PACKETS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sipsieve_packets_total",
        "SIP packets by classifier outcome",
        &["outcome"]
    ).unwrap();

    /// Entries currently written to the membership maps
    pub static ref POLICY_ENTRIES: IntGaugeVec = register_int_gauge_vec!(
        "sipsieve_policy_entries",
        "Entries in the blocked/allowed address maps",
        &["set"]
    ).unwrap();

    /// Failed reads of the per-CPU counter map
    pub static ref COUNTER_READ_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "sipsieve_counter_read_errors_total",
        "Failed reads of the XDP counter map"
    ).unwrap();
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Metrics output is not valid UTF-8: {}", e);
        String::from("# Error: invalid UTF-8 in metrics\n")
    })
}
