use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};

use crate::change::Topic;
use crate::error::AppError;
use crate::metrics::SessionMetrics;
use crate::server::AppState;
use crate::session::{RegistryError, SessionId, SessionTransport};

use super::message::{ClientMessage, ServerMessage};

/// WebSocket upgrade handler
#[tracing::instrument(name = "ws.upgrade", skip(ws, state))]
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if !state.registry().is_accepting() {
        tracing::warn!("WebSocket upgrade refused, not accepting sessions");
        return AppError::from(RegistryError::NotAccepting).into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection
#[tracing::instrument(name = "ws.connection", skip(socket, state), fields(otel.kind = "server"))]
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_start = std::time::Instant::now();
    let (transport, mut rx) = SessionTransport::channel(state.settings.websocket.channel_buffer);

    let (session_id, sessions) = match state.registry().register(transport.clone()) {
        Ok(registered) => registered,
        Err(e) => {
            tracing::warn!(error = %e, "Session rejected");
            let (mut ws_sender, _) = socket.split();
            let error_msg = ServerMessage::error("SESSION_REJECTED", e.to_string());
            if let Ok(json) = serde_json::to_string(&error_msg) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };

    SessionMetrics::record_opened(sessions);
    tracing::info!(session_id = %session_id, sessions = sessions, "WebSocket session established");

    let broadcaster = state.broadcaster().clone();
    if let Err(e) = broadcaster.welcome(session_id, sessions).await {
        tracing::debug!(session_id = %session_id, error = %e, "Failed to send welcome");
    }
    if state.settings.websocket.announce_presence {
        broadcaster.announce_presence(sessions).await;
    }

    // Split socket into sender and receiver
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Writer: drains the session transport until a close request or error
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match msg.to_json() {
                Some(Ok(text)) => text,
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Failed to serialize message");
                    continue;
                }
                None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };

            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Reader: applies client requests
    let reader_state = state.clone();
    let reader_transport = transport.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &reader_state, session_id, &reader_transport).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    // Wait for either task to complete, then stop the other
    tokio::select! {
        _ = &mut send_task => {
            tracing::debug!(session_id = %session_id, "Send task completed");
            recv_task.abort();
        }
        _ = &mut recv_task => {
            tracing::debug!(session_id = %session_id, "Receive task completed");
            send_task.abort();
        }
    }

    state.registry().unregister(session_id);
    let remaining = state.registry().count();

    let duration = connection_start.elapsed().as_secs_f64();
    SessionMetrics::record_closed(remaining, duration);

    if state.settings.websocket.announce_presence && state.registry().is_accepting() {
        broadcaster.announce_presence(remaining).await;
    }

    tracing::info!(
        session_id = %session_id,
        duration_secs = duration,
        "WebSocket session closed"
    );
}

/// Process a received WebSocket message
/// Returns false if the connection should be closed
async fn process_message(
    msg: Message,
    state: &AppState,
    session_id: SessionId,
    transport: &SessionTransport,
) -> bool {
    let timeout = state.settings.websocket.delivery_timeout();

    match msg {
        Message::Text(text) => {
            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse client message");
                    let _ = transport
                        .send(ServerMessage::error("INVALID_MESSAGE", e.to_string()), timeout)
                        .await;
                    return true;
                }
            };

            for reply in handle_client_message(client_msg, state, session_id) {
                let _ = transport.send(reply, timeout).await;
            }
            true
        }
        Message::Binary(_) => {
            let _ = transport
                .send(
                    ServerMessage::error("UNSUPPORTED_FORMAT", "Binary messages are not supported"),
                    timeout,
                )
                .await;
            true
        }
        // Axum answers pings itself
        Message::Ping(_) | Message::Pong(_) => true,
        Message::Close(_) => {
            tracing::debug!(session_id = %session_id, "Received close frame");
            false
        }
    }
}

/// Apply a parsed client message and return the frames to send back
fn handle_client_message(
    msg: ClientMessage,
    state: &AppState,
    session_id: SessionId,
) -> Vec<ServerMessage> {
    match msg {
        ClientMessage::Subscribe { .. } | ClientMessage::Unsubscribe { .. }
            if state.registry().subscriptions_of(session_id).is_none() =>
        {
            vec![ServerMessage::error(
                "SESSION_CLOSED",
                "Session is no longer registered",
            )]
        }
        ClientMessage::Subscribe { topics } => {
            let (topics, errors) = parse_topics(topics);
            let mut replies = Vec::new();
            if !topics.is_empty() {
                state.registry().subscribe(session_id, topics.iter().cloned());
                tracing::info!(session_id = %session_id, topics = ?topics, "Subscribed to topics");
                replies.push(ServerMessage::subscribed(topics));
            }
            if !errors.is_empty() {
                replies.push(ServerMessage::error("INVALID_TOPIC", errors.join("; ")));
            }
            replies
        }
        ClientMessage::Unsubscribe { topics } => {
            let (topics, errors) = parse_topics(topics);
            let mut replies = Vec::new();
            if !topics.is_empty() {
                state.registry().unsubscribe(session_id, topics.iter().cloned());
                tracing::info!(session_id = %session_id, topics = ?topics, "Unsubscribed from topics");
                replies.push(ServerMessage::unsubscribed(topics));
            }
            if !errors.is_empty() {
                replies.push(ServerMessage::error("INVALID_TOPIC", errors.join("; ")));
            }
            replies
        }
        ClientMessage::Ping => vec![ServerMessage::Pong],
    }
}

/// Split requested topic names into valid topics and error descriptions
fn parse_topics(raw: Vec<String>) -> (Vec<Topic>, Vec<String>) {
    let mut topics = Vec::new();
    let mut errors = Vec::new();

    for name in raw {
        match name.parse::<Topic>() {
            Ok(topic) => {
                if !topics.contains(&topic) {
                    topics.push(topic);
                }
            }
            Err(e) => errors.push(format!("{}: {}", name, e)),
        }
    }

    (topics, errors)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Settings;
    use crate::relay::MemorySource;

    fn state_with_session() -> (AppState, SessionId) {
        let state = AppState::new(Settings::default(), Arc::new(MemorySource::new()));
        let (transport, _rx) = SessionTransport::channel(4);
        let (session_id, _) = state.registry().register(transport).unwrap();
        (state, session_id)
    }

    fn subscribe(topics: &[&str]) -> ClientMessage {
        ClientMessage::Subscribe {
            topics: topics.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn unsubscribe(topics: &[&str]) -> ClientMessage {
        ClientMessage::Unsubscribe {
            topics: topics.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_replies_and_registers_topics() {
        let (state, id) = state_with_session();

        let replies = handle_client_message(subscribe(&["status:shipped", "entity:7"]), &state, id);
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            ServerMessage::Subscribed { topics } => {
                assert_eq!(topics, &vec![Topic::status("shipped"), Topic::entity("7")]);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(state
            .registry()
            .sessions_for(&Topic::status("shipped"))
            .contains(&id));
    }

    #[tokio::test]
    async fn test_invalid_topics_get_error_frame() {
        let (state, id) = state_with_session();

        let replies = handle_client_message(subscribe(&["status:shipped", "bogus:x"]), &state, id);
        assert_eq!(replies.len(), 2);
        assert!(matches!(replies[0], ServerMessage::Subscribed { .. }));
        match &replies[1] {
            ServerMessage::Error { code, message } => {
                assert_eq!(code, "INVALID_TOPIC");
                assert!(message.starts_with("bogus:x"));
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        // Only invalid topics: no subscribed frame, nothing registered
        let replies = handle_client_message(subscribe(&["entity:"]), &state, id);
        assert_eq!(replies.len(), 1);
        assert!(matches!(&replies[0], ServerMessage::Error { code, .. } if code == "INVALID_TOPIC"));
        assert_eq!(
            state.registry().subscriptions_of(id).unwrap(),
            vec![Topic::status("shipped")]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_and_ping_replies() {
        let (state, id) = state_with_session();
        handle_client_message(subscribe(&["status:shipped", "status:pending"]), &state, id);

        let replies = handle_client_message(unsubscribe(&["status:pending"]), &state, id);
        match &replies[..] {
            [ServerMessage::Unsubscribed { topics }] => {
                assert_eq!(topics, &vec![Topic::status("pending")]);
            }
            other => panic!("unexpected replies: {:?}", other),
        }
        assert_eq!(
            state.registry().subscriptions_of(id).unwrap(),
            vec![Topic::status("shipped")]
        );

        let replies = handle_client_message(ClientMessage::Ping, &state, id);
        assert!(matches!(&replies[..], [ServerMessage::Pong]));
    }

    #[tokio::test]
    async fn test_requests_after_unregister_are_rejected() {
        let (state, id) = state_with_session();
        state.registry().unregister(id);

        let replies = handle_client_message(subscribe(&["status:shipped"]), &state, id);
        assert!(matches!(&replies[..], [ServerMessage::Error { code, .. }] if code == "SESSION_CLOSED"));
        assert!(state
            .registry()
            .sessions_for(&Topic::status("shipped"))
            .is_empty());
    }

    #[test]
    fn test_parse_topics_splits_invalid() {
        let (topics, errors) = parse_topics(vec![
            "status:shipped".to_string(),
            "status:shipped".to_string(),
            "entity:bad name".to_string(),
            "all".to_string(),
        ]);

        assert_eq!(topics, vec![Topic::status("shipped"), Topic::All]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("entity:bad name"));
    }

    #[test]
    fn test_parse_topics_empty() {
        let (topics, errors) = parse_topics(vec![]);
        assert!(topics.is_empty());
        assert!(errors.is_empty());
    }
}
