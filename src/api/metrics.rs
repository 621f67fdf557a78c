//! Prometheus metrics endpoint.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::error::Result;
use crate::metrics::{self, RelayMetrics, SessionMetrics};
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> Result<impl IntoResponse> {
    // Gauges are refreshed from live state before each scrape
    RelayMetrics::set_state(state.supervisor.relay().state());
    SessionMetrics::set_active(state.registry().count());

    let output = metrics::encode_metrics()?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    ))
}
