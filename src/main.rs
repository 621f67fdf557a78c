use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use change_relay_service::config::Settings;
use change_relay_service::relay::PgNotificationSource;
use change_relay_service::server::{create_app, AppState};
use change_relay_service::supervisor::Supervisor;
use change_relay_service::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing; the guard flushes exported spans on exit
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!(channel = %settings.database.channel, "Configuration loaded");

    let source = Arc::new(PgNotificationSource::new(
        settings.database.url.clone(),
        settings.database.channel.clone(),
    ));

    // Starts the relay and the broadcaster
    let state = AppState::new(settings.clone(), source);
    let supervisor = state.supervisor.clone();
    tracing::info!("Application state initialized");

    let app = create_app(state);

    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(supervisor))
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Resolves once a termination signal has been received and every session
/// has been told about the shutdown
async fn shutdown_signal_handler(supervisor: Arc<Supervisor>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }

    // Sessions are notified while the listener is still draining
    let result = supervisor.shutdown("server shutting down").await;
    if !result.completed {
        tracing::warn!(
            aborted_tasks = result.aborted_tasks,
            "Shutdown deadline exceeded"
        );
    }
}
