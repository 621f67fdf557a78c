//! Session handle and related types

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::change::Topic;
use crate::websocket::{OutboundMessage, ServerMessage};

pub type SessionId = Uuid;

/// Why a single frame could not be handed to a session's writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("session transport is closed")]
    Closed,

    #[error("session transport did not accept the frame in time")]
    Timeout,
}

/// Send side of a session's outbound frame queue.
///
/// The receiving half is drained by the socket writer task, so ordering of
/// frames on one transport is the order they were accepted here.
#[derive(Debug, Clone)]
pub struct SessionTransport {
    sender: mpsc::Sender<OutboundMessage>,
}

impl SessionTransport {
    pub fn new(sender: mpsc::Sender<OutboundMessage>) -> Self {
        Self { sender }
    }

    /// Create a transport and the receiver its writer should drain
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    pub async fn send(&self, message: ServerMessage, timeout: Duration) -> Result<(), DeliveryError> {
        self.send_outbound(OutboundMessage::Raw(message), timeout).await
    }

    pub async fn send_outbound(
        &self,
        message: OutboundMessage,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        self.sender
            .send_timeout(message, timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => DeliveryError::Timeout,
                mpsc::error::SendTimeoutError::Closed(_) => DeliveryError::Closed,
            })
    }

    /// Ask the writer to close the socket once earlier frames are written
    pub async fn request_close(&self, timeout: Duration) -> Result<(), DeliveryError> {
        self.send_outbound(OutboundMessage::Close, timeout).await
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// A connected client session
#[derive(Debug)]
pub struct ClientSession {
    pub id: SessionId,
    pub connected_at: DateTime<Utc>,
    pub(crate) subscriptions: BTreeSet<Topic>,
    pub transport: SessionTransport,
}

impl ClientSession {
    pub(crate) fn new(transport: SessionTransport) -> Self {
        Self {
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
            subscriptions: BTreeSet::new(),
            transport,
        }
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Topic> {
        self.subscriptions.iter()
    }
}

/// Transport handle paired with the session it belongs to, copied out of the
/// registry for delivery outside the lock
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub id: SessionId,
    pub transport: SessionTransport,
}

/// Read-only view of one session for health reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub connected_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub subscriptions: Vec<Topic>,
}

/// Registry statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_sessions: usize,
    pub accepting: bool,
    /// topic -> subscriber count
    pub topics: std::collections::BTreeMap<String, usize>,
}

/// Error returned when a session cannot be registered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("not accepting new sessions")]
    NotAccepting,

    #[error("session limit exceeded ({current}/{max})")]
    LimitExceeded { current: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_reports_closed() {
        let (transport, rx) = SessionTransport::channel(1);
        drop(rx);

        let result = transport
            .send(ServerMessage::Pong, Duration::from_millis(10))
            .await;
        assert_eq!(result, Err(DeliveryError::Closed));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_transport_times_out_when_full() {
        let (transport, _rx) = SessionTransport::channel(1);

        transport
            .send(ServerMessage::Pong, Duration::from_millis(10))
            .await
            .unwrap();
        let result = transport
            .send(ServerMessage::Pong, Duration::from_millis(10))
            .await;
        assert_eq!(result, Err(DeliveryError::Timeout));
    }
}
