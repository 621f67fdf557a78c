//! Owner of the relay pipeline.
//!
//! The supervisor wires Relay → Broadcaster, reacts to relay signals and
//! runs the shutdown sequence:
//! 1. Stop accepting new sessions
//! 2. Stop the relay (cancels any pending reconnect)
//! 3. Notify every session and request its transport to close
//! 4. Stop background tasks, aborting whatever misses the deadline

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{Settings, ShutdownSettings};
use crate::fanout::{Broadcaster, ShutdownReport};
use crate::relay::{NotificationSource, Relay, RelaySignal, RelayState, RelayStatus};
use crate::session::SessionRegistry;

/// Overall service health as reported to the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Relay is listening
    Healthy,
    /// Relay is connecting or waiting to reconnect
    Degraded,
    /// Relay exhausted its retries or is stopped
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Read-only status for the health collaborator
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub health: HealthStatus,
    pub accepting_sessions: bool,
    pub relay: RelayStatus,
    pub sessions: usize,
}

/// Result of a supervised shutdown
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Every phase finished inside the deadline
    pub completed: bool,
    /// Session notification outcome, `None` if it timed out
    pub sessions: Option<ShutdownReport>,
    /// Background tasks aborted after the deadline
    pub aborted_tasks: usize,
    pub duration: Duration,
}

pub struct Supervisor {
    registry: Arc<SessionRegistry>,
    broadcaster: Arc<Broadcaster>,
    relay: Relay,
    relay_failed: Arc<AtomicBool>,
    shutting_down: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_config: ShutdownSettings,
    started_at: Instant,
}

impl Supervisor {
    /// Build the pipeline, spawn its background tasks and start the relay.
    /// Must be called within a Tokio runtime.
    pub fn start(settings: &Settings, source: Arc<dyn NotificationSource>) -> Self {
        let registry = Arc::new(SessionRegistry::with_limit(settings.websocket.max_sessions));
        let broadcaster = Arc::new(Broadcaster::new(
            registry.clone(),
            settings.websocket.delivery_timeout(),
        ));

        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let relay = Relay::new(&settings.relay, source, intake_tx);
        let (shutdown_tx, _) = broadcast::channel(1);
        let relay_failed = Arc::new(AtomicBool::new(false));

        let broadcaster_task = tokio::spawn(
            broadcaster
                .clone()
                .run(intake_rx, shutdown_tx.subscribe()),
        );

        let observer_task = tokio::spawn(observe_signals(
            relay.subscribe_signals(),
            shutdown_tx.subscribe(),
            relay.clone(),
            registry.clone(),
            relay_failed.clone(),
        ));

        relay.start();

        tracing::info!(
            max_attempts = settings.relay.max_attempts,
            base_delay_ms = settings.relay.base_delay_ms,
            cap_delay_ms = settings.relay.cap_delay_ms,
            "Relay pipeline started"
        );

        Self {
            registry,
            broadcaster,
            relay,
            relay_failed,
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(vec![broadcaster_task, observer_task]),
            shutdown_config: settings.shutdown.clone(),
            started_at: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn status(&self) -> SupervisorStatus {
        let relay = self.relay.status();
        let health = if self.relay_failed.load(Ordering::Acquire) {
            HealthStatus::Unhealthy
        } else {
            match relay.state {
                RelayState::Listening => HealthStatus::Healthy,
                RelayState::Connecting | RelayState::ReconnectWait => HealthStatus::Degraded,
                RelayState::Disconnected | RelayState::Failed => HealthStatus::Unhealthy,
            }
        };

        SupervisorStatus {
            health,
            accepting_sessions: self.registry.is_accepting(),
            relay,
            sessions: self.registry.count(),
        }
    }

    /// Operator-driven restart after the relay gave up.
    /// Returns false if the relay is still running or shutdown has begun.
    pub fn restart_relay(&self) -> bool {
        if self.shutting_down.load(Ordering::Acquire) || self.relay.state().is_active() {
            return false;
        }

        self.relay_failed.store(false, Ordering::Release);
        self.registry.set_accepting(true);
        self.relay.start();
        tracing::warn!("Relay restarted by operator");
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop the relay, notify sessions and stop background tasks within the
    /// configured deadline
    #[tracing::instrument(name = "supervisor.shutdown", skip(self))]
    pub async fn shutdown(&self, reason: &str) -> ShutdownResult {
        let start = Instant::now();
        let deadline = self.shutdown_config.deadline();
        let mut result = ShutdownResult::default();
        self.shutting_down.store(true, Ordering::Release);

        tracing::info!(reason = %reason, "Starting shutdown - Phase 1: Refusing new sessions");
        self.registry.set_accepting(false);

        tracing::info!("Phase 2: Stopping relay");
        self.relay.stop();

        tracing::info!("Phase 3: Notifying sessions");
        let notice_budget = self
            .shutdown_config
            .notice_timeout()
            .min(deadline.saturating_sub(start.elapsed()));
        match timeout(notice_budget, self.broadcaster.shutdown(reason)).await {
            Ok(report) => result.sessions = Some(report),
            Err(_) => tracing::warn!("Timed out notifying sessions of shutdown"),
        }

        tracing::info!("Phase 4: Stopping background tasks");
        let _ = self.shutdown_tx.send(());
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            let remaining = deadline.saturating_sub(start.elapsed());
            if timeout(remaining, &mut task).await.is_err() {
                task.abort();
                result.aborted_tasks += 1;
            }
        }

        result.completed = result.sessions.is_some() && result.aborted_tasks == 0;
        result.duration = start.elapsed();

        tracing::info!(
            completed = result.completed,
            aborted_tasks = result.aborted_tasks,
            duration_ms = result.duration.as_millis() as u64,
            "Shutdown completed"
        );

        result
    }
}

/// React to relay lifecycle signals until shutdown
async fn observe_signals(
    mut signals: broadcast::Receiver<RelaySignal>,
    mut shutdown: broadcast::Receiver<()>,
    relay: Relay,
    registry: Arc<SessionRegistry>,
    relay_failed: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            signal = signals.recv() => match signal {
                Ok(RelaySignal::Connected) => {
                    tracing::debug!("Relay connected");
                }
                Ok(RelaySignal::Reconnecting { attempt, delay }) => {
                    tracing::debug!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Relay reconnecting"
                    );
                }
                Ok(RelaySignal::Fatal { attempts }) => {
                    apply_fatal(&relay, &registry, &relay_failed, attempts);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Relay signal observer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Degrade the service after a fatal relay signal. A signal left over from a
/// cycle that has since been restarted is ignored. Returns whether the
/// service was degraded.
fn apply_fatal(
    relay: &Relay,
    registry: &SessionRegistry,
    relay_failed: &AtomicBool,
    attempts: u32,
) -> bool {
    if relay.state() != RelayState::Failed {
        tracing::debug!(
            attempts = attempts,
            state = %relay.state(),
            "Ignoring fatal signal from a previous relay cycle"
        );
        return false;
    }

    relay_failed.store(true, Ordering::Release);
    registry.set_accepting(false);
    tracing::error!(
        attempts = attempts,
        "Relay failed permanently; refusing new sessions"
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::relay::MemorySource;
    use crate::session::SessionTransport;

    fn settings(max_attempts: u32) -> Settings {
        let mut settings = Settings::default();
        settings.relay = RelayConfig {
            base_delay_ms: 100,
            cap_delay_ms: 1_000,
            max_attempts,
            jitter_factor: 0.0,
        };
        settings
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_relay_marks_unhealthy() {
        let source = Arc::new(MemorySource::new());
        let supervisor = Supervisor::start(&settings(2), source.clone());

        for _ in 0..1_000 {
            if supervisor.status().health == HealthStatus::Unhealthy
                && !supervisor.status().accepting_sessions
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let status = supervisor.status();
        assert_eq!(status.health, HealthStatus::Unhealthy);
        assert_eq!(status.relay.state, RelayState::Failed);
        assert!(!status.accepting_sessions);
        assert_eq!(source.connect_attempts(), 3);

        let (transport, _rx) = SessionTransport::channel(4);
        assert!(supervisor.registry().register(transport).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_failure() {
        let source = Arc::new(MemorySource::new());
        let supervisor = Supervisor::start(&settings(0), source.clone());

        for _ in 0..1_000 {
            if supervisor.status().health == HealthStatus::Unhealthy
                && !supervisor.registry().is_accepting()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(supervisor.relay().state(), RelayState::Failed);

        let _publisher = source.push_connection();
        assert!(supervisor.restart_relay());
        assert!(!supervisor.restart_relay());
        for _ in 0..1_000 {
            if supervisor.status().health == HealthStatus::Healthy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(supervisor.status().health, HealthStatus::Healthy);
        assert!(supervisor.status().accepting_sessions);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fatal_after_restart_is_ignored() {
        let source = Arc::new(MemorySource::new());
        let supervisor = Supervisor::start(&settings(0), source.clone());
        wait_until(|| supervisor.status().health == HealthStatus::Unhealthy).await;

        let _publisher = source.push_connection();
        assert!(supervisor.restart_relay());
        wait_until(|| supervisor.relay().state() == RelayState::Listening).await;

        // The previous cycle's fatal arrives after the restart
        assert!(!apply_fatal(
            supervisor.relay(),
            supervisor.registry(),
            &supervisor.relay_failed,
            0
        ));

        let status = supervisor.status();
        assert_eq!(status.health, HealthStatus::Healthy);
        assert!(status.accepting_sessions);
        assert!(!supervisor.restart_relay());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_without_sessions() {
        let source = Arc::new(MemorySource::new());
        let _publisher = source.push_connection();
        let supervisor = Supervisor::start(&settings(3), source);

        let result = supervisor.shutdown("test shutdown").await;

        assert!(result.completed);
        assert_eq!(result.sessions.unwrap().sessions, 0);
        assert_eq!(result.aborted_tasks, 0);
        assert_eq!(supervisor.relay().state(), RelayState::Disconnected);
        assert!(!supervisor.registry().is_accepting());
        assert!(!supervisor.restart_relay());
    }
}
