use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub shutdown: ShutdownSettings,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Notification channel passed to `LISTEN`
    #[serde(default = "default_channel")]
    pub channel: String,
}

/// Reconnect policy for the store subscription
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Delay before the first reconnect attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single reconnect delay
    #[serde(default = "default_cap_delay_ms")]
    pub cap_delay_ms: u64,
    /// Consecutive failures tolerated before the relay gives up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Jitter factor (0.0 to 1.0), 0 keeps delays deterministic
    #[serde(default)]
    pub jitter_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Outbound frames buffered per session before sends start waiting
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
    /// How long a single delivery may wait on a full session buffer
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    /// Maximum concurrent sessions, 0 means unlimited
    #[serde(default)]
    pub max_sessions: usize,
    /// Broadcast the session count on connect/disconnect
    #[serde(default = "default_true")]
    pub announce_presence: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownSettings {
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_notice_timeout_ms")]
    pub notice_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_database_url() -> String {
    "postgres://localhost:5432/app".to_string()
}

fn default_channel() -> String {
    "change_events".to_string()
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_cap_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_channel_buffer() -> usize {
    64
}

fn default_delivery_timeout_ms() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}

fn default_deadline_secs() -> u64 {
    10
}

fn default_notice_timeout_ms() -> u64 {
    2_000
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "change-relay-service".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("database.url", default_database_url())?
            .set_default("database.channel", default_channel())?
            .set_default("relay.base_delay_ms", default_base_delay_ms())?
            .set_default("relay.cap_delay_ms", default_cap_delay_ms())?
            .set_default("relay.max_attempts", default_max_attempts())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // RELAY__MAX_ATTEMPTS, DATABASE__URL, SERVER__PORT, ...
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl RelayConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn cap_delay(&self) -> Duration {
        Duration::from_millis(self.cap_delay_ms)
    }
}

impl WebSocketConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

impl ShutdownSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn notice_timeout(&self) -> Duration {
        Duration::from_millis(self.notice_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            channel: default_channel(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            cap_delay_ms: default_cap_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_factor: 0.0,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            channel_buffer: default_channel_buffer(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            max_sessions: 0,
            announce_presence: true,
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            notice_timeout_ms: default_notice_timeout_ms(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            relay: RelayConfig::default(),
            websocket: WebSocketConfig::default(),
            shutdown: ShutdownSettings::default(),
            otel: OtelConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8081);
    }

    #[test]
    fn test_relay_defaults() {
        let relay = RelayConfig::default();
        assert_eq!(relay.base_delay(), Duration::from_secs(1));
        assert_eq!(relay.cap_delay(), Duration::from_secs(30));
        assert_eq!(relay.max_attempts, 10);
        assert_eq!(relay.jitter_factor, 0.0);
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let settings: Settings = Config::builder()
            .set_override("relay.max_attempts", 3)
            .unwrap()
            .set_override("database.channel", "orders_changed")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.relay.max_attempts, 3);
        assert_eq!(settings.relay.base_delay_ms, 1_000);
        assert_eq!(settings.database.channel, "orders_changed");
        assert_eq!(settings.websocket.channel_buffer, 64);
        assert_eq!(settings.server_addr(), "0.0.0.0:8081");
    }
}
