use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::change::ChangeEvent;
use crate::config::RelayConfig;
use crate::metrics::RelayMetrics;

use super::backoff::{BackoffConfig, ExponentialBackoff};
use super::source::{NotificationSource, NotificationStream, SourceError};
use super::state::{RelayCounters, RelaySignal, RelayState, RelayStats, RelayStatus};

const SIGNAL_CAPACITY: usize = 16;

struct RelayCore {
    state: RelayState,
    backoff: ExponentialBackoff,
    /// Bumped by every `start()` and `stop()`; a cycle whose epoch is stale
    /// must not touch state
    epoch: u64,
    task: Option<JoinHandle<()>>,
    fatal_emitted: bool,
}

struct RelayShared {
    max_attempts: u32,
    source: Arc<dyn NotificationSource>,
    intake: mpsc::UnboundedSender<ChangeEvent>,
    signals: broadcast::Sender<RelaySignal>,
    core: Mutex<RelayCore>,
    /// Mirror of `RelayCore::epoch` for the per-message check
    live_epoch: AtomicU64,
    counters: RelayCounters,
}

/// Why a listening cycle ended
enum Disconnect {
    Closed,
    Error(SourceError),
}

/// Keeps a single subscription to the store's notification channel alive.
///
/// Every valid notification becomes one [`ChangeEvent`] pushed onto the
/// intake channel in the order it was received. Connection failures are
/// retried with capped exponential backoff until `max_attempts` consecutive
/// failures, after which the relay parks in [`RelayState::Failed`] and emits
/// [`RelaySignal::Fatal`].
#[derive(Clone)]
pub struct Relay {
    shared: Arc<RelayShared>,
}

impl Relay {
    pub fn new(
        config: &RelayConfig,
        source: Arc<dyn NotificationSource>,
        intake: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let backoff = ExponentialBackoff::with_config(BackoffConfig::from(config));

        Self {
            shared: Arc::new(RelayShared {
                max_attempts: config.max_attempts,
                source,
                intake,
                signals,
                core: Mutex::new(RelayCore {
                    state: RelayState::Disconnected,
                    backoff,
                    epoch: 0,
                    task: None,
                    fatal_emitted: false,
                }),
                live_epoch: AtomicU64::new(0),
                counters: RelayCounters::default(),
            }),
        }
    }

    /// Subscribe to lifecycle signals
    pub fn subscribe_signals(&self) -> broadcast::Receiver<RelaySignal> {
        self.shared.signals.subscribe()
    }

    /// Begin a connection cycle.
    ///
    /// No-op while a cycle is already connecting, listening or waiting to
    /// reconnect. From `Failed` this is an explicit restart with a fresh
    /// attempt budget. Must be called within a Tokio runtime.
    pub fn start(&self) {
        let mut core = self.shared.core.lock();
        if core.state.is_active() {
            tracing::debug!(state = %core.state, "Relay already running, start ignored");
            return;
        }

        core.epoch += 1;
        let epoch = core.epoch;
        self.shared.live_epoch.store(epoch, Ordering::Release);
        core.backoff.reset();
        core.fatal_emitted = false;
        self.shared.set_state(&mut core, RelayState::Connecting);

        let shared = self.shared.clone();
        core.task = Some(tokio::spawn(async move {
            shared.run(epoch).await;
        }));

        tracing::info!(source = %self.shared.source.describe(), "Relay starting");
    }

    /// Cancel any pending reconnect, close the active connection and return
    /// to `Disconnected`. Idempotent.
    pub fn stop(&self) {
        let mut core = self.shared.core.lock();
        core.epoch += 1;
        self.shared.live_epoch.store(core.epoch, Ordering::Release);
        let task = core.task.take();
        let previous = core.state;
        self.shared.set_state(&mut core, RelayState::Disconnected);
        drop(core);

        if let Some(task) = task {
            task.abort();
        }

        if previous != RelayState::Disconnected {
            tracing::info!(previous_state = %previous, "Relay stopped");
        }
    }

    pub fn status(&self) -> RelayStatus {
        let core = self.shared.core.lock();
        RelayStatus {
            state: core.state,
            // The attempt that tipped the relay into Failed was never made
            attempt: core.backoff.attempt().min(self.shared.max_attempts),
            max_attempts: self.shared.max_attempts,
        }
    }

    pub fn state(&self) -> RelayState {
        self.shared.core.lock().state
    }

    pub fn stats(&self) -> RelayStats {
        self.shared.counters.snapshot()
    }
}

impl RelayShared {
    fn set_state(&self, core: &mut RelayCore, state: RelayState) {
        core.state = state;
        RelayMetrics::set_state(state);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.live_epoch.load(Ordering::Acquire) == epoch
    }

    async fn run(&self, epoch: u64) {
        loop {
            let disconnect = match self.source.connect().await {
                Ok(stream) => {
                    if !self.on_connected(epoch) {
                        return;
                    }
                    self.listen(epoch, stream).await
                }
                Err(e) => Disconnect::Error(e),
            };

            match &disconnect {
                Disconnect::Closed => {
                    tracing::warn!("Store notification stream closed");
                }
                Disconnect::Error(e) => {
                    tracing::warn!(error = %e, "Store notification connection failed");
                }
            }
            self.counters
                .connection_failures
                .fetch_add(1, Ordering::Relaxed);

            let Some(delay) = self.on_failure(epoch) else {
                return;
            };

            tokio::time::sleep(delay).await;

            if !self.resume(epoch) {
                return;
            }
        }
    }

    fn on_connected(&self, epoch: u64) -> bool {
        let mut core = self.core.lock();
        if core.epoch != epoch {
            return false;
        }

        let was_retrying = core.backoff.attempt() > 0;
        core.backoff.reset();
        self.set_state(&mut core, RelayState::Listening);
        drop(core);

        self.counters
            .connections_established
            .fetch_add(1, Ordering::Relaxed);
        let _ = self.signals.send(RelaySignal::Connected);

        tracing::info!(
            source = %self.source.describe(),
            reconnected = was_retrying,
            "Relay listening"
        );
        true
    }

    /// Record a failed connect or a lost connection. Returns the delay before
    /// the next attempt, or `None` if this cycle is over.
    fn on_failure(&self, epoch: u64) -> Option<Duration> {
        let mut core = self.core.lock();
        if core.epoch != epoch {
            return None;
        }

        let delay = core.backoff.next_delay();
        let attempt = core.backoff.attempt();

        if attempt > self.max_attempts {
            self.set_state(&mut core, RelayState::Failed);
            core.task = None;
            let first = !core.fatal_emitted;
            core.fatal_emitted = true;
            drop(core);

            if first {
                tracing::error!(
                    attempts = attempt - 1,
                    max_attempts = self.max_attempts,
                    "Relay exhausted reconnect attempts"
                );
                let _ = self.signals.send(RelaySignal::Fatal {
                    attempts: attempt - 1,
                });
            }
            return None;
        }

        self.set_state(&mut core, RelayState::ReconnectWait);
        drop(core);

        RelayMetrics::record_reconnect();
        let _ = self.signals.send(RelaySignal::Reconnecting { attempt, delay });

        tracing::info!(
            attempt = attempt,
            max_attempts = self.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling relay reconnect"
        );

        Some(delay)
    }

    /// Leave `ReconnectWait` for another connect attempt. A stop that landed
    /// after the timer fired but before this point wins.
    fn resume(&self, epoch: u64) -> bool {
        let mut core = self.core.lock();
        if core.epoch != epoch || core.state != RelayState::ReconnectWait {
            return false;
        }
        self.set_state(&mut core, RelayState::Connecting);
        true
    }

    async fn listen(&self, epoch: u64, mut stream: Box<dyn NotificationStream>) -> Disconnect {
        loop {
            match stream.recv().await {
                Ok(Some(payload)) => {
                    if !self.is_current(epoch) {
                        return Disconnect::Closed;
                    }
                    self.handle_payload(&payload);
                }
                Ok(None) => return Disconnect::Closed,
                Err(e) => return Disconnect::Error(e),
            }
        }
    }

    fn handle_payload(&self, payload: &str) {
        self.counters
            .notifications_received
            .fetch_add(1, Ordering::Relaxed);
        RelayMetrics::record_notification();

        let event = match ChangeEvent::parse(payload) {
            Ok(event) => event,
            Err(e) => {
                self.counters
                    .malformed_dropped
                    .fetch_add(1, Ordering::Relaxed);
                RelayMetrics::record_malformed();
                tracing::warn!(
                    error = %e,
                    payload_len = payload.len(),
                    "Dropping malformed notification"
                );
                return;
            }
        };

        tracing::debug!(
            operation = %event.operation(),
            entity_type = %event.entity_type(),
            "Relaying change event"
        );

        if self.intake.send(event).is_err() {
            tracing::warn!("Broadcaster intake closed, change event discarded");
        } else {
            self.counters.events_emitted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemorySource;

    fn config(max_attempts: u32) -> RelayConfig {
        RelayConfig {
            base_delay_ms: 1_000,
            cap_delay_ms: 30_000,
            max_attempts,
            jitter_factor: 0.0,
        }
    }

    async fn wait_for(relay: &Relay, state: RelayState) {
        for _ in 0..10_000 {
            if relay.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("relay never reached {:?}, stuck in {:?}", state, relay.state());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_connects_and_relays() {
        let source = Arc::new(MemorySource::new());
        let publisher = source.push_connection();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let relay = Relay::new(&config(3), source.clone(), tx);
        let mut signals = relay.subscribe_signals();

        relay.start();
        wait_for(&relay, RelayState::Listening).await;
        assert_eq!(signals.recv().await.unwrap(), RelaySignal::Connected);

        publisher.notify(r#"{"operation":"INSERT","entityType":"order","record":{"id":1}}"#);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.entity_id().as_deref(), Some("1"));

        let status = relay.status();
        assert_eq!(status.attempt, 0);
        assert_eq!(status.max_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_listening_is_noop() {
        let source = Arc::new(MemorySource::new());
        let _publisher = source.push_connection();
        let (tx, _rx) = mpsc::unbounded_channel();
        let relay = Relay::new(&config(3), source.clone(), tx);

        relay.start();
        wait_for(&relay, RelayState::Listening).await;
        relay.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(source.connect_attempts(), 1);
        assert_eq!(relay.state(), RelayState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let source = Arc::new(MemorySource::new());
        let publisher = source.push_connection();
        let (tx, _rx) = mpsc::unbounded_channel();
        let relay = Relay::new(&config(3), source, tx);

        relay.start();
        wait_for(&relay, RelayState::Listening).await;

        relay.stop();
        relay.stop();
        assert_eq!(relay.state(), RelayState::Disconnected);

        // Aborting the cycle drops the stream
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(publisher.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_does_not_change_state() {
        let source = Arc::new(MemorySource::new());
        let publisher = source.push_connection();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let relay = Relay::new(&config(3), source, tx);

        relay.start();
        wait_for(&relay, RelayState::Listening).await;

        publisher.notify(r#"{"operation":"UPDATE","entityType":"ord"#);
        publisher.notify(r#"{"operation":"UPDATE","entityType":"order","record":{"id":2}}"#);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.entity_id().as_deref(), Some("2"));
        assert_eq!(relay.state(), RelayState::Listening);

        let stats = relay.stats();
        assert_eq!(stats.notifications_received, 2);
        assert_eq!(stats.malformed_dropped, 1);
        assert_eq!(stats.events_emitted, 1);
    }
}
