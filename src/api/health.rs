//! Health check and statistics endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::fanout::BroadcasterStatsSnapshot;
use crate::relay::{RelayStats, RelayStatus};
use crate::server::AppState;
use crate::session::{RegistryStats, SessionInfo};
use crate::supervisor::HealthStatus;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub relay: RelayStatus,
    pub sessions: SessionHealthResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHealthResponse {
    pub total: usize,
    pub accepting: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub relay: RelayStats,
    pub dispatcher: BroadcasterStatsSnapshot,
    pub registry: RegistryStats,
    pub sessions: Vec<SessionInfo>,
}

/// GET /health - 503 once the relay has given up or stopped
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let status = state.supervisor.status();

    let code = match status.health {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };

    (
        code,
        Json(HealthResponse {
            status: status.health,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.supervisor.uptime().as_secs(),
            relay: status.relay,
            sessions: SessionHealthResponse {
                total: status.sessions,
                accepting: status.accepting_sessions,
            },
        }),
    )
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        relay: state.supervisor.relay().stats(),
        dispatcher: state.broadcaster().stats(),
        registry: state.registry().stats(),
        sessions: state.registry().snapshot(),
    })
}
