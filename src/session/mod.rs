//! Session registry for connected clients
//!
//! This module provides:
//! - Session handles and their outbound transport
//! - Topic subscription indexing
//! - Read-only snapshots for health reporting

mod registry;
mod types;

pub use registry::SessionRegistry;
pub use types::{
    ClientSession, DeliveryError, RegistryError, RegistryStats, SessionId, SessionInfo,
    SessionTarget, SessionTransport,
};
