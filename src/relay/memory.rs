//! In-memory notification source.
//!
//! Connection outcomes are scripted up front: each `connect()` pops the next
//! entry, and an empty script fails. A scripted connection yields whatever is
//! published through its [`MemoryPublisher`] and closes when the publisher is
//! dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::source::{NotificationSource, NotificationStream, SourceError};

enum ScriptedConnect {
    Fail(String),
    Open(mpsc::UnboundedReceiver<Result<String, String>>),
}

#[derive(Default)]
pub struct MemorySource {
    script: Mutex<VecDeque<ScriptedConnect>>,
    attempts: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next connect attempt fails with `reason`
    pub fn push_failure(&self, reason: impl Into<String>) {
        self.script
            .lock()
            .push_back(ScriptedConnect::Fail(reason.into()));
    }

    /// Next connect attempt succeeds; payloads are fed through the returned
    /// publisher
    pub fn push_connection(&self) -> MemoryPublisher {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().push_back(ScriptedConnect::Open(rx));
        MemoryPublisher { tx }
    }

    /// Number of times `connect()` has been called
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSource for MemorySource {
    async fn connect(&self) -> Result<Box<dyn NotificationStream>, SourceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let next = self.script.lock().pop_front();
        match next {
            Some(ScriptedConnect::Open(rx)) => Ok(Box::new(MemoryStream { rx })),
            Some(ScriptedConnect::Fail(reason)) => Err(SourceError::Unavailable(reason)),
            None => Err(SourceError::Unavailable("no connection scripted".to_string())),
        }
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Feeds one scripted connection
#[derive(Clone)]
pub struct MemoryPublisher {
    tx: mpsc::UnboundedSender<Result<String, String>>,
}

impl MemoryPublisher {
    /// Deliver a raw payload. Returns false once the connection is gone.
    pub fn notify(&self, payload: impl Into<String>) -> bool {
        self.tx.send(Ok(payload.into())).is_ok()
    }

    /// Break the connection with a transport error
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.tx.send(Err(reason.into())).is_ok()
    }

    /// The relay side of the connection has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Result<String, String>>,
}

#[async_trait]
impl NotificationStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<String>, SourceError> {
        match self.rx.recv().await {
            Some(Ok(payload)) => Ok(Some(payload)),
            Some(Err(reason)) => Err(SourceError::Unavailable(reason)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_outcomes() {
        let source = MemorySource::new();
        source.push_failure("down");
        let publisher = source.push_connection();

        assert!(source.connect().await.is_err());

        let mut stream = source.connect().await.unwrap();
        publisher.notify("hello");
        assert_eq!(stream.recv().await.unwrap().as_deref(), Some("hello"));

        publisher.fail("reset");
        assert!(stream.recv().await.is_err());

        drop(publisher);
        assert!(stream.recv().await.unwrap().is_none());

        assert!(source.connect().await.is_err());
        assert_eq!(source.connect_attempts(), 3);
    }
}
