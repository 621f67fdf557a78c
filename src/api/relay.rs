//! Operator controls for the relay.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::relay::RelayStatus;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct RestartResponse {
    pub restarted: bool,
    pub relay: RelayStatus,
}

/// POST /relay/restart - restart a relay that has failed or been stopped
pub async fn restart_relay(State(state): State<AppState>) -> Result<Json<RestartResponse>> {
    if state.supervisor.is_shutting_down() {
        return Err(AppError::Unavailable("service is shutting down".into()));
    }

    if !state.supervisor.restart_relay() {
        let current = state.supervisor.relay().state();
        return Err(AppError::Validation(format!(
            "relay is already running ({})",
            current
        )));
    }

    Ok(Json(RestartResponse {
        restarted: true,
        relay: state.supervisor.relay().status(),
    }))
}
