//! Store notification sources.
//!
//! A [`NotificationSource`] opens one subscription to the store's change
//! channel; the relay owns reconnect policy, so sources never retry on their
//! own.

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("notification source unavailable: {0}")]
    Unavailable(String),
}

/// Factory for subscriptions to the store's notification channel
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Open a new subscription
    async fn connect(&self) -> Result<Box<dyn NotificationStream>, SourceError>;

    /// Human readable description for logs
    fn describe(&self) -> String;
}

/// An open subscription
#[async_trait]
pub trait NotificationStream: Send {
    /// Next raw payload. `Ok(None)` means the connection closed.
    async fn recv(&mut self) -> Result<Option<String>, SourceError>;
}

/// PostgreSQL `LISTEN` source
pub struct PgNotificationSource {
    url: String,
    channel: String,
}

impl PgNotificationSource {
    pub fn new(url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn connect(&self) -> Result<Box<dyn NotificationStream>, SourceError> {
        let mut listener = PgListener::connect(&self.url).await?;
        listener.listen(&self.channel).await?;

        tracing::debug!(channel = %self.channel, "LISTEN established");

        Ok(Box::new(PgNotificationStream { listener }))
    }

    fn describe(&self) -> String {
        format!("postgres:{}", self.channel)
    }
}

struct PgNotificationStream {
    listener: PgListener,
}

#[async_trait]
impl NotificationStream for PgNotificationStream {
    async fn recv(&mut self) -> Result<Option<String>, SourceError> {
        // try_recv surfaces a dropped connection as Ok(None) instead of
        // silently reconnecting, which would hide the gap from the relay.
        let notification = self.listener.try_recv().await?;
        Ok(notification.map(|n| n.payload().to_string()))
    }
}
