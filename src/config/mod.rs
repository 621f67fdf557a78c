mod settings;

pub use settings::{
    DatabaseConfig, OtelConfig, RelayConfig, ServerConfig, Settings, ShutdownSettings,
    WebSocketConfig,
};
