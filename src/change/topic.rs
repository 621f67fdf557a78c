use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_KEY_LEN: usize = 128;

/// Subscription scope a session can hold.
///
/// Textual form: `all`, `entity:<id>`, `status:<status>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    All,
    ByEntity(String),
    ByStatus(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicParseError {
    #[error("unknown topic kind: {0}")]
    UnknownKind(String),

    #[error("invalid topic key: {0:?}")]
    InvalidKey(String),
}

impl Topic {
    pub fn entity(id: impl Into<String>) -> Self {
        Topic::ByEntity(id.into())
    }

    pub fn status(status: impl Into<String>) -> Self {
        Topic::ByStatus(status.into())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::All => f.write_str("all"),
            Topic::ByEntity(id) => write!(f, "entity:{}", id),
            Topic::ByStatus(status) => write!(f, "status:{}", status),
        }
    }
}

impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(Topic::All);
        }

        let (kind, key) = s
            .split_once(':')
            .ok_or_else(|| TopicParseError::UnknownKind(s.to_string()))?;

        if !is_valid_key(key) {
            return Err(TopicParseError::InvalidKey(key.to_string()));
        }

        match kind {
            "entity" => Ok(Topic::ByEntity(key.to_string())),
            "status" => Ok(Topic::ByStatus(key.to_string())),
            other => Err(TopicParseError::UnknownKind(other.to_string())),
        }
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}

fn is_valid_key(key: &str) -> bool {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return false;
    }

    key.chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}
