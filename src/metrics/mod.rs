//! Prometheus metrics for the change relay.
//!
//! This module provides metrics for monitoring the relay pipeline:
//! - Relay metrics (state, reconnects, notifications received and dropped)
//! - Dispatch metrics (events by operation, deliveries by scope)
//! - Session metrics (active sessions, opened/closed, duration)

mod helpers;

pub use helpers::{encode_metrics, DispatchMetrics, RelayMetrics, SessionMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "change_relay";

lazy_static! {
    // ============================================================================
    // Relay Metrics
    // ============================================================================

    /// Relay state (0=disconnected, 1=connecting, 2=listening, 3=reconnect_wait, 4=failed)
    pub static ref RELAY_STATE: IntGauge = register_int_gauge!(
        format!("{}_relay_state", METRIC_PREFIX),
        "Relay state (0=disconnected, 1=connecting, 2=listening, 3=reconnect_wait, 4=failed)"
    ).unwrap();

    /// Total scheduled reconnect attempts
    pub static ref RELAY_RECONNECTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_relay_reconnects_total", METRIC_PREFIX),
        "Total reconnect attempts scheduled by the relay"
    ).unwrap();

    /// Raw notifications received from the store
    pub static ref RELAY_NOTIFICATIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_relay_notifications_total", METRIC_PREFIX),
        "Total notifications received from the store"
    ).unwrap();

    /// Notifications dropped because the payload could not be parsed
    pub static ref RELAY_MALFORMED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_relay_malformed_total", METRIC_PREFIX),
        "Total notifications dropped due to malformed payloads"
    ).unwrap();

    // ============================================================================
    // Dispatch Metrics
    // ============================================================================

    /// Change events dispatched by operation
    pub static ref EVENTS_DISPATCHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_dispatched_total", METRIC_PREFIX),
        "Total change events dispatched",
        &["operation"]
    ).unwrap();

    /// Successful deliveries by scope (all, entity, status, control)
    pub static ref DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_deliveries_total", METRIC_PREFIX),
        "Total frames delivered to sessions",
        &["scope"]
    ).unwrap();

    /// Failed deliveries by scope
    pub static ref DELIVERY_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_delivery_failures_total", METRIC_PREFIX),
        "Total frames that could not be delivered",
        &["scope"]
    ).unwrap();

    /// Time spent dispatching one change event
    pub static ref DISPATCH_LATENCY: Histogram = register_histogram!(
        format!("{}_dispatch_latency_seconds", METRIC_PREFIX),
        "Dispatch latency per change event in seconds",
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    // ============================================================================
    // Session Metrics
    // ============================================================================

    /// Currently registered sessions
    pub static ref SESSIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_sessions_active", METRIC_PREFIX),
        "Number of registered sessions"
    ).unwrap();

    /// Sessions opened
    pub static ref SESSIONS_OPENED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_sessions_opened_total", METRIC_PREFIX),
        "Total sessions opened"
    ).unwrap();

    /// Sessions closed
    pub static ref SESSIONS_CLOSED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_sessions_closed_total", METRIC_PREFIX),
        "Total sessions closed"
    ).unwrap();

    /// Session duration
    pub static ref SESSION_DURATION: Histogram = register_histogram!(
        format!("{}_session_duration_seconds", METRIC_PREFIX),
        "Session duration in seconds",
        vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]
    ).unwrap();
}
