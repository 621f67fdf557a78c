//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use crate::relay::RelayState;

use super::{
    DELIVERIES_TOTAL, DELIVERY_FAILURES_TOTAL, DISPATCH_LATENCY, EVENTS_DISPATCHED_TOTAL,
    RELAY_MALFORMED_TOTAL, RELAY_NOTIFICATIONS_TOTAL, RELAY_RECONNECTS_TOTAL, RELAY_STATE,
    SESSIONS_ACTIVE, SESSIONS_CLOSED_TOTAL, SESSIONS_OPENED_TOTAL, SESSION_DURATION,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording relay metrics
pub struct RelayMetrics;

impl RelayMetrics {
    pub fn set_state(state: RelayState) {
        RELAY_STATE.set(state.as_gauge());
    }

    pub fn record_reconnect() {
        RELAY_RECONNECTS_TOTAL.inc();
    }

    pub fn record_notification() {
        RELAY_NOTIFICATIONS_TOTAL.inc();
    }

    pub fn record_malformed() {
        RELAY_MALFORMED_TOTAL.inc();
    }
}

/// Helper struct for recording dispatch metrics
pub struct DispatchMetrics;

impl DispatchMetrics {
    pub fn record_event(operation: &str) {
        EVENTS_DISPATCHED_TOTAL.with_label_values(&[operation]).inc();
    }

    pub fn record_delivered(scope: &str, count: u64) {
        if count > 0 {
            DELIVERIES_TOTAL.with_label_values(&[scope]).inc_by(count);
        }
    }

    pub fn record_failed(scope: &str, count: u64) {
        if count > 0 {
            DELIVERY_FAILURES_TOTAL.with_label_values(&[scope]).inc_by(count);
        }
    }

    pub fn observe_latency(seconds: f64) {
        DISPATCH_LATENCY.observe(seconds);
    }
}

/// Helper struct for recording session metrics
pub struct SessionMetrics;

impl SessionMetrics {
    pub fn record_opened(active: usize) {
        SESSIONS_OPENED_TOTAL.inc();
        SESSIONS_ACTIVE.set(active as i64);
    }

    pub fn record_closed(active: usize, duration_secs: f64) {
        SESSIONS_CLOSED_TOTAL.inc();
        SESSIONS_ACTIVE.set(active as i64);
        SESSION_DURATION.observe(duration_secs);
    }

    pub fn set_active(active: usize) {
        SESSIONS_ACTIVE.set(active as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_metrics() {
        RelayMetrics::record_notification();
        DispatchMetrics::record_event("insert");
        DispatchMetrics::record_delivered("all", 2);

        let output = encode_metrics().unwrap();
        assert!(output.contains("change_relay_relay_notifications_total"));
        assert!(output.contains("change_relay_events_dispatched_total"));
        assert!(output.contains("change_relay_deliveries_total"));
    }
}
