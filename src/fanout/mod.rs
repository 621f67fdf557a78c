//! Fanout of change events to registered sessions.

mod broadcaster;

pub use broadcaster::{
    Broadcaster, BroadcasterStats, BroadcasterStatsSnapshot, DispatchReport, ShutdownReport,
};
