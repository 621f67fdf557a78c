//! Relay lifecycle state and the signals it emits

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Lifecycle of the store subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Disconnected,
    Connecting,
    Listening,
    ReconnectWait,
    /// Retries exhausted. Only an explicit `start()` leaves this state.
    Failed,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Disconnected => "disconnected",
            RelayState::Connecting => "connecting",
            RelayState::Listening => "listening",
            RelayState::ReconnectWait => "reconnect_wait",
            RelayState::Failed => "failed",
        }
    }

    /// Numeric encoding used by the state gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            RelayState::Disconnected => 0,
            RelayState::Connecting => 1,
            RelayState::Listening => 2,
            RelayState::ReconnectWait => 3,
            RelayState::Failed => 4,
        }
    }

    /// A cycle is already running and `start()` has nothing to do
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RelayState::Connecting | RelayState::Listening | RelayState::ReconnectWait
        )
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot returned by `Relay::status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub state: RelayState,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Signals observed by the owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelaySignal {
    /// Subscription established (initially or after a reconnect)
    Connected,
    /// Connection lost, next attempt scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries exhausted; emitted once per failed cycle
    Fatal { attempts: u32 },
}

/// Counters kept by the relay
#[derive(Debug, Default)]
pub struct RelayCounters {
    pub notifications_received: AtomicU64,
    pub events_emitted: AtomicU64,
    pub malformed_dropped: AtomicU64,
    pub connections_established: AtomicU64,
    pub connection_failures: AtomicU64,
}

impl RelayCounters {
    pub fn snapshot(&self) -> RelayStats {
        RelayStats {
            notifications_received: self.notifications_received.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of relay counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub notifications_received: u64,
    pub events_emitted: u64,
    pub malformed_dropped: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(RelayState::Listening.is_active());
        assert!(RelayState::ReconnectWait.is_active());
        assert!(!RelayState::Disconnected.is_active());
        assert!(!RelayState::Failed.is_active());
    }

    #[test]
    fn test_status_serializes() {
        let status = RelayStatus {
            state: RelayState::ReconnectWait,
            attempt: 2,
            max_attempts: 10,
        };
        let value = serde_json::to_value(status).unwrap();
        assert_eq!(value["state"], "reconnect_wait");
        assert_eq!(value["maxAttempts"], 10);
    }
}
