// Core pipeline
pub mod change;
pub mod fanout;
pub mod relay;
pub mod session;
pub mod supervisor;

// Transport and HTTP surface
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;
