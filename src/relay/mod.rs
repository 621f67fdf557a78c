//! Store subscription with reconnect-with-backoff.
//!
//! The [`Relay`] owns the single upstream subscription and turns raw
//! notifications into change events for the broadcaster.

mod backoff;
mod memory;
mod source;
mod state;
mod subscriber;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use memory::{MemoryPublisher, MemorySource};
pub use source::{NotificationSource, NotificationStream, PgNotificationSource, SourceError};
pub use state::{RelayCounters, RelaySignal, RelayState, RelayStats, RelayStatus};
pub use subscriber::Relay;
