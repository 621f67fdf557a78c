use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::{health, prometheus_metrics, restart_relay, stats};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Operator actions
        .route("/relay/restart", post(restart_relay))
}
