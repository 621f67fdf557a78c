//! API layer - HTTP endpoint handlers.

mod health;
mod metrics;
mod relay;
mod routes;

pub use health::{health, stats};
pub use metrics::prometheus_metrics;
pub use relay::restart_relay;
pub use routes::api_routes;
