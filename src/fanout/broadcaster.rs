use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::change::{ChangeEvent, Topic};
use crate::metrics::DispatchMetrics;
use crate::session::{DeliveryError, SessionId, SessionRegistry, SessionTarget};
use crate::websocket::{OutboundMessage, ServerMessage};

/// Maximum number of concurrent session sends
const MAX_CONCURRENT_SENDS: usize = 100;

/// Fanout size from which a frame is serialized once and shared
const PRESERIALIZATION_THRESHOLD: usize = 4;

/// Delivery scope, used as the metrics label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    All,
    Entity,
    Status,
    Control,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Scope::All => "all",
            Scope::Entity => "entity",
            Scope::Status => "status",
            Scope::Control => "control",
        }
    }
}

/// Outcome of dispatching one change event
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    /// Registered sessions when dispatch began
    pub session_count: usize,
    pub delivered: usize,
    pub failed: usize,
    pub entity_recipients: usize,
    pub status_recipients: usize,
}

/// Outcome of [`Broadcaster::shutdown`]
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub sessions: usize,
    pub notified: usize,
    pub close_requested: usize,
}

/// Statistics for the broadcaster
#[derive(Debug, Default)]
pub struct BroadcasterStats {
    pub events_dispatched: AtomicU64,
    pub total_delivered: AtomicU64,
    pub total_failed: AtomicU64,
    pub entity_deliveries: AtomicU64,
    pub status_deliveries: AtomicU64,
}

impl BroadcasterStats {
    pub fn snapshot(&self) -> BroadcasterStatsSnapshot {
        BroadcasterStatsSnapshot {
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            entity_deliveries: self.entity_deliveries.load(Ordering::Relaxed),
            status_deliveries: self.status_deliveries.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of broadcaster statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcasterStatsSnapshot {
    pub events_dispatched: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    pub entity_deliveries: u64,
    pub status_deliveries: u64,
}

/// Dispatches change events to registered sessions.
///
/// Every session receives each event on its operation channel (`insert`,
/// `update`, `delete`). Sessions subscribed to the event's entity or status
/// additionally receive it on `entity:<id>` / `status:<status>`; a session
/// matching both gets both frames.
pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
    delivery_timeout: Duration,
    stats: BroadcasterStats,
}

impl Broadcaster {
    pub fn new(registry: Arc<SessionRegistry>, delivery_timeout: Duration) -> Self {
        Self {
            registry,
            delivery_timeout,
            stats: BroadcasterStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> BroadcasterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Consume change events until the intake closes or shutdown is signalled.
    ///
    /// Events are dispatched one at a time, so each session sees them in
    /// intake order.
    pub async fn run(
        self: Arc<Self>,
        mut intake: mpsc::UnboundedReceiver<ChangeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tracing::info!("Broadcaster started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("Broadcaster received shutdown signal");
                    break;
                }
                event = intake.recv() => {
                    match event {
                        Some(event) => {
                            self.dispatch(&event).await;
                        }
                        None => {
                            tracing::info!("Broadcaster intake closed");
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Broadcaster stopped");
    }

    /// Deliver one change event to every matching session
    #[tracing::instrument(
        name = "broadcaster.dispatch",
        skip(self, event),
        fields(operation = %event.operation(), entity_type = %event.entity_type())
    )]
    pub async fn dispatch(&self, event: &ChangeEvent) -> DispatchReport {
        let start = Instant::now();
        let mut report = DispatchReport::default();

        let everyone = self.registry.targets_for(&Topic::All);
        report.session_count = everyone.len();

        let message = ServerMessage::change(event.operation().as_str(), event);
        let (delivered, failed) = self.send_to_targets(&everyone, &message, Scope::All).await;
        report.delivered += delivered;
        report.failed += failed;

        if let Some(id) = event.entity_id() {
            let topic = Topic::ByEntity(id);
            let targets = self.registry.targets_for(&topic);
            if !targets.is_empty() {
                let message = ServerMessage::change(topic.to_string(), event);
                let (delivered, failed) =
                    self.send_to_targets(&targets, &message, Scope::Entity).await;
                report.entity_recipients = delivered;
                report.delivered += delivered;
                report.failed += failed;
                self.stats
                    .entity_deliveries
                    .fetch_add(delivered as u64, Ordering::Relaxed);
            }
        }

        if let Some(status) = event.status() {
            let topic = Topic::status(status);
            let targets = self.registry.targets_for(&topic);
            if !targets.is_empty() {
                let message = ServerMessage::change(topic.to_string(), event);
                let (delivered, failed) =
                    self.send_to_targets(&targets, &message, Scope::Status).await;
                report.status_recipients = delivered;
                report.delivered += delivered;
                report.failed += failed;
                self.stats
                    .status_deliveries
                    .fetch_add(delivered as u64, Ordering::Relaxed);
            }
        }

        // Update stats
        self.stats.events_dispatched.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .total_failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);

        DispatchMetrics::record_event(event.operation().as_str());
        DispatchMetrics::observe_latency(start.elapsed().as_secs_f64());

        tracing::info!(
            operation = %event.operation(),
            entity_type = %event.entity_type(),
            session_count_at_dispatch = report.session_count,
            delivered = report.delivered,
            failed = report.failed,
            "Change event dispatched"
        );

        report
    }

    /// Greet a newly registered session
    pub async fn welcome(&self, session_id: SessionId, sessions: usize) -> Result<(), DeliveryError> {
        let target = self
            .registry
            .target(session_id)
            .ok_or(DeliveryError::Closed)?;

        let result = target
            .transport
            .send(
                ServerMessage::Welcome {
                    session_id,
                    sessions,
                },
                self.delivery_timeout,
            )
            .await;

        match result {
            Ok(()) => DispatchMetrics::record_delivered(Scope::Control.as_str(), 1),
            Err(_) => DispatchMetrics::record_failed(Scope::Control.as_str(), 1),
        }
        result
    }

    /// Tell every session how many sessions are connected
    pub async fn announce_presence(&self, sessions: usize) -> (usize, usize) {
        let targets = self.registry.targets_for(&Topic::All);
        self.send_to_targets(&targets, &ServerMessage::Presence { sessions }, Scope::Control)
            .await
    }

    /// Send a shutdown notice to every registered session, then ask each
    /// transport to close. For every session the notice is queued strictly
    /// before the close request, and a session whose notice could not be
    /// queued is never asked to close.
    #[tracing::instrument(name = "broadcaster.shutdown", skip(self))]
    pub async fn shutdown(&self, reason: &str) -> ShutdownReport {
        let targets = self.registry.targets_for(&Topic::All);
        let mut report = ShutdownReport {
            sessions: targets.len(),
            ..Default::default()
        };

        if targets.is_empty() {
            return report;
        }

        tracing::info!(sessions = targets.len(), reason = %reason, "Notifying sessions of shutdown");

        let notice = ServerMessage::shutdown(reason);
        let timeout = self.delivery_timeout;
        let mut futures: FuturesUnordered<_> = targets
            .into_iter()
            .map(|target| {
                let notice = notice.clone();
                async move {
                    if let Err(e) = target.transport.send(notice, timeout).await {
                        // No close without a notice; the owner's deadline
                        // takes care of this session
                        tracing::debug!(
                            session_id = %target.id,
                            error = %e,
                            "Failed to send shutdown notice, close not requested"
                        );
                        return (false, false);
                    }
                    let closed = target.transport.request_close(timeout).await.is_ok();
                    (true, closed)
                }
            })
            .collect();

        while let Some((notified, closed)) = futures.next().await {
            report.notified += notified as usize;
            report.close_requested += closed as usize;
        }

        tracing::info!(
            sessions = report.sessions,
            notified = report.notified,
            close_requested = report.close_requested,
            "Shutdown notices sent"
        );

        report
    }

    /// Send a message to a list of sessions.
    ///
    /// Small fanouts are sent sequentially; larger ones are serialized once
    /// and sent with bounded concurrency. A failed send is logged and counted
    /// and never stops delivery to the remaining sessions.
    async fn send_to_targets(
        &self,
        targets: &[SessionTarget],
        message: &ServerMessage,
        scope: Scope,
    ) -> (usize, usize) {
        if targets.is_empty() {
            return (0, 0);
        }

        let timeout = self.delivery_timeout;
        let mut delivered = 0;
        let mut failed = 0;

        if targets.len() < PRESERIALIZATION_THRESHOLD {
            for target in targets {
                match target.transport.send(message.clone(), timeout).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        failed += 1;
                        log_delivery_failure(target.id, scope, e);
                    }
                }
            }
        } else {
            let outbound = match OutboundMessage::preserialized(message) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to pre-serialize message, falling back to per-session serialization");
                    OutboundMessage::Raw(message.clone())
                }
            };

            let mut futures = FuturesUnordered::new();
            for target in targets {
                let msg = outbound.clone();
                futures.push(async move {
                    let result = target.transport.send_outbound(msg, timeout).await;
                    (target.id, result)
                });

                // Process completed futures when we hit the concurrency limit
                while futures.len() >= MAX_CONCURRENT_SENDS {
                    match futures.next().await {
                        Some((_, Ok(()))) => delivered += 1,
                        Some((id, Err(e))) => {
                            failed += 1;
                            log_delivery_failure(id, scope, e);
                        }
                        None => break,
                    }
                }
            }

            while let Some((id, result)) = futures.next().await {
                match result {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        failed += 1;
                        log_delivery_failure(id, scope, e);
                    }
                }
            }
        }

        DispatchMetrics::record_delivered(scope.as_str(), delivered as u64);
        DispatchMetrics::record_failed(scope.as_str(), failed as u64);

        (delivered, failed)
    }
}

fn log_delivery_failure(session_id: SessionId, scope: Scope, error: DeliveryError) {
    tracing::debug!(
        session_id = %session_id,
        scope = scope.as_str(),
        error = %error,
        "Delivery to session failed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Operation;
    use crate::session::SessionTransport;
    use serde_json::json;

    fn event(record: serde_json::Value) -> ChangeEvent {
        ChangeEvent::new(Operation::Update, "order", record, chrono::Utc::now()).unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Some(json) = msg.to_json() {
                frames.push(serde_json::from_str(&json.unwrap()).unwrap());
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_dispatch_with_no_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Broadcaster::new(registry, Duration::from_millis(50));

        let report = broadcaster.dispatch(&event(json!({"id": 1}))).await;
        assert_eq!(report.session_count, 0);
        assert_eq!(report.delivered, 0);
        assert_eq!(broadcaster.stats().events_dispatched, 1);
    }

    #[tokio::test]
    async fn test_entity_and_status_match_get_two_frames() {
        let registry = Arc::new(SessionRegistry::new());
        let (transport, mut rx) = SessionTransport::channel(16);
        let (id, _) = registry.register(transport).unwrap();
        registry.subscribe(id, [Topic::entity("9"), Topic::status("paid")]);

        let broadcaster = Broadcaster::new(registry, Duration::from_millis(50));
        let report = broadcaster
            .dispatch(&event(json!({"id": 9, "status": "paid"})))
            .await;

        assert_eq!(report.delivered, 3);
        assert_eq!(report.entity_recipients, 1);
        assert_eq!(report.status_recipients, 1);

        let channels: Vec<String> = drain(&mut rx)
            .iter()
            .map(|f| f["channel"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(channels, vec!["update", "entity:9", "status:paid"]);
    }

    #[tokio::test]
    async fn test_failed_session_does_not_abort_fanout() {
        let registry = Arc::new(SessionRegistry::new());
        let mut receivers = Vec::new();
        for i in 0..6 {
            let (transport, rx) = SessionTransport::channel(4);
            registry.register(transport).unwrap();
            // Two sessions have already lost their writer
            if i % 3 != 0 {
                receivers.push(rx);
            }
        }

        let broadcaster = Broadcaster::new(registry, Duration::from_millis(50));
        let report = broadcaster.dispatch(&event(json!({"id": 1}))).await;

        assert_eq!(report.session_count, 6);
        assert_eq!(report.delivered, 4);
        assert_eq!(report.failed, 2);
        for rx in receivers.iter_mut() {
            assert_eq!(drain(rx).len(), 1);
        }
    }

    #[tokio::test]
    async fn test_welcome_and_presence() {
        let registry = Arc::new(SessionRegistry::new());
        let (transport, mut rx) = SessionTransport::channel(8);
        let (id, count) = registry.register(transport).unwrap();

        let broadcaster = Broadcaster::new(registry, Duration::from_millis(50));
        broadcaster.welcome(id, count).await.unwrap();
        assert_eq!(broadcaster.announce_presence(1).await, (1, 0));

        let frames = drain(&mut rx);
        assert_eq!(frames[0]["type"], "welcome");
        assert_eq!(frames[0]["sessionId"], id.to_string());
        assert_eq!(frames[0]["sessions"], 1);
        assert_eq!(frames[1]["type"], "presence");

        assert_eq!(
            broadcaster.welcome(SessionId::new_v4(), 1).await,
            Err(DeliveryError::Closed)
        );
    }

    #[tokio::test]
    async fn test_shutdown_notice_precedes_close() {
        let registry = Arc::new(SessionRegistry::new());
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (transport, rx) = SessionTransport::channel(8);
            registry.register(transport).unwrap();
            receivers.push(rx);
        }

        let broadcaster = Broadcaster::new(registry, Duration::from_millis(50));
        let report = broadcaster.shutdown("maintenance").await;
        assert_eq!(report.sessions, 3);
        assert_eq!(report.notified, 3);
        assert_eq!(report.close_requested, 3);

        for rx in receivers.iter_mut() {
            let first = rx.try_recv().unwrap();
            let json = first.to_json().unwrap().unwrap();
            assert!(json.contains(r#""type":"shutdown""#));
            assert!(rx.try_recv().unwrap().is_close());
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry, Duration::from_millis(50)));
        let (_tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(broadcaster.clone().run(rx, shutdown_rx));
        shutdown_tx.send(()).unwrap();
        tokio_test::assert_ok!(handle.await);
    }
}
