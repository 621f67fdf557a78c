use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change::{ChangeEvent, Topic};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Ping,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        sessions: usize,
    },
    /// Change frames are tagged `"type": "change"` for every operation. The
    /// operation itself travels in `operation`, and `channel` names the
    /// scope that matched (`insert`/`update`/`delete`, `entity:<id>` or
    /// `status:<status>`).
    #[serde(rename = "change")]
    Change {
        channel: String,
        #[serde(flatten)]
        event: ChangeEventFrame,
    },
    #[serde(rename = "subscribed")]
    Subscribed {
        #[serde(rename = "payload")]
        topics: Vec<Topic>,
    },
    #[serde(rename = "unsubscribed")]
    Unsubscribed {
        #[serde(rename = "payload")]
        topics: Vec<Topic>,
    },
    #[serde(rename = "presence")]
    Presence { sessions: usize },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error { code: String, message: String },
    #[serde(rename = "shutdown")]
    Shutdown { reason: String },
}

/// Serialized body of a change frame, flattened next to `type` and
/// `channel`. Clients switching on the operation read `operation`, not
/// `type`, which is always `"change"`.
///
/// Kept separate from [`ChangeEvent`] so clients can deserialize frames
/// without going through the store-side validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEventFrame {
    pub operation: String,
    pub entity_type: String,
    pub record: serde_json::Value,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}

impl From<&ChangeEvent> for ChangeEventFrame {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            operation: event.operation().as_str().to_string(),
            entity_type: event.entity_type().to_string(),
            record: serde_json::Value::Object(event.record().clone()),
            occurred_at: event.occurred_at(),
        }
    }
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn change(channel: impl Into<String>, event: &ChangeEvent) -> Self {
        Self::Change {
            channel: channel.into(),
            event: ChangeEventFrame::from(event),
        }
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self::Shutdown {
            reason: reason.into(),
        }
    }

    pub fn subscribed(topics: Vec<Topic>) -> Self {
        Self::Subscribed { topics }
    }

    pub fn unsubscribed(topics: Vec<Topic>) -> Self {
        Self::Unsubscribed { topics }
    }
}

/// A frame queued on a session's outbound channel
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Serialized by the socket writer
    Raw(ServerMessage),
    /// Serialized once and shared across a fanout
    Preserialized(Arc<str>),
    /// Close the socket after every frame queued before this one
    Close,
}

impl OutboundMessage {
    pub fn preserialized(message: &ServerMessage) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(message)?;
        Ok(Self::Preserialized(Arc::from(json)))
    }

    /// JSON text for the frame, `None` for [`OutboundMessage::Close`]
    pub fn to_json(&self) -> Option<Result<String, serde_json::Error>> {
        match self {
            Self::Raw(message) => Some(serde_json::to_string(message)),
            Self::Preserialized(text) => Some(Ok(text.to_string())),
            Self::Close => None,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Operation;
    use serde_json::json;

    #[test]
    fn test_parse_client_messages() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "subscribe", "payload": {"topics": ["status:shipped", "entity:9"]}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Subscribe { topics } => assert_eq!(topics.len(), 2),
            other => panic!("unexpected message: {:?}", other),
        }

        let msg: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_change_frame_shape() {
        let event = ChangeEvent::new(
            Operation::Update,
            "order",
            json!({"id": 3, "status": "shipped"}),
            chrono::Utc::now(),
        )
        .unwrap();

        let value = serde_json::to_value(ServerMessage::change("status:shipped", &event)).unwrap();
        assert_eq!(value["type"], "change");
        assert_eq!(value["channel"], "status:shipped");
        assert_eq!(value["operation"], "update");
        assert_eq!(value["entityType"], "order");
        assert_eq!(value["record"]["status"], "shipped");
    }

    #[test]
    fn test_preserialized_matches_raw() {
        let message = ServerMessage::shutdown("maintenance");
        let raw = OutboundMessage::Raw(message.clone()).to_json().unwrap().unwrap();
        let shared = OutboundMessage::preserialized(&message)
            .unwrap()
            .to_json()
            .unwrap()
            .unwrap();
        assert_eq!(raw, shared);
        assert!(OutboundMessage::Close.to_json().is_none());
    }
}
