//! Change events relayed from the store and the topics sessions subscribe to.

mod event;
mod topic;

pub use event::{ChangeEvent, Operation, PayloadError};
pub use topic::{Topic, TopicParseError};
