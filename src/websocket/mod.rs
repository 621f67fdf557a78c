//! WebSocket transport: session wire messages and the upgrade handler.

mod handler;
mod message;

pub use handler::ws_handler;
pub use message::{ChangeEventFrame, ClientMessage, OutboundMessage, ServerMessage};
