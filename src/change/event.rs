use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Kind of row mutation reported by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Trigger functions emit TG_OP verbatim (upper case); hand-written producers
// tend to use lower case.
impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(serde::de::Error::unknown_variant(
                other,
                &["insert", "update", "delete"],
            )),
        }
    }
}

/// Errors produced while turning a raw notification into a [`ChangeEvent`]
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record must be a JSON object")]
    RecordNotObject,

    #[error("entity type must not be empty")]
    EmptyEntityType,

    #[error("delete notification carries an empty record")]
    EmptyDeleteRecord,
}

/// Wire shape of a notification payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChange {
    operation: Operation,
    #[serde(alias = "entity_type")]
    entity_type: String,
    record: Value,
    #[serde(default, alias = "occurred_at")]
    occurred_at: Option<DateTime<Utc>>,
}

/// One insert/update/delete against a tracked entity.
///
/// Fields are private so an event can only be built through [`ChangeEvent::new`]
/// or [`ChangeEvent::parse`], both of which enforce that a delete carries the
/// pre-deletion row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    operation: Operation,
    entity_type: String,
    record: Map<String, Value>,
    occurred_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        operation: Operation,
        entity_type: impl Into<String>,
        record: Value,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, PayloadError> {
        let entity_type = entity_type.into();
        if entity_type.trim().is_empty() {
            return Err(PayloadError::EmptyEntityType);
        }

        let record = match record {
            Value::Object(map) => map,
            _ => return Err(PayloadError::RecordNotObject),
        };

        if operation == Operation::Delete && record.is_empty() {
            return Err(PayloadError::EmptyDeleteRecord);
        }

        Ok(Self {
            operation,
            entity_type,
            record,
            occurred_at,
        })
    }

    /// Parse a notification payload. A missing `occurredAt` falls back to the
    /// time of receipt.
    pub fn parse(payload: &str) -> Result<Self, PayloadError> {
        let raw: RawChange = serde_json::from_str(payload)?;
        let occurred_at = raw.occurred_at.unwrap_or_else(Utc::now);
        Self::new(raw.operation, raw.entity_type, raw.record, occurred_at)
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn record(&self) -> &Map<String, Value> {
        &self.record
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Identifier of the changed entity (`record.id`), if present
    pub fn entity_id(&self) -> Option<String> {
        match self.record.get("id")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Status-like attribute of the record (`record.status`), if present
    pub fn status(&self) -> Option<&str> {
        match self.record.get("status")? {
            Value::String(s) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_trigger_payload() {
        let payload = r#"{
            "operation": "UPDATE",
            "entityType": "order",
            "record": {"id": 42, "status": "shipped", "total": 99.5},
            "occurredAt": "2024-03-01T12:30:00.123456+00:00"
        }"#;

        let event = ChangeEvent::parse(payload).unwrap();
        assert_eq!(event.operation(), Operation::Update);
        assert_eq!(event.entity_type(), "order");
        assert_eq!(event.entity_id().as_deref(), Some("42"));
        assert_eq!(event.status(), Some("shipped"));
        assert_eq!(event.occurred_at().timestamp(), 1_709_296_200);
    }

    #[test]
    fn test_parse_snake_case_and_lowercase() {
        let payload = r#"{
            "operation": "insert",
            "entity_type": "order",
            "record": {"id": "ord-1"}
        }"#;

        let event = ChangeEvent::parse(payload).unwrap();
        assert_eq!(event.operation(), Operation::Insert);
        assert_eq!(event.entity_id().as_deref(), Some("ord-1"));
        assert_eq!(event.status(), None);
    }

    #[test]
    fn test_delete_requires_previous_record() {
        let payload = r#"{"operation": "DELETE", "entityType": "order", "record": {}}"#;
        assert!(matches!(
            ChangeEvent::parse(payload),
            Err(PayloadError::EmptyDeleteRecord)
        ));

        let payload = r#"{"operation": "DELETE", "entityType": "order", "record": {"id": 7, "status": "cancelled"}}"#;
        let event = ChangeEvent::parse(payload).unwrap();
        assert_eq!(event.record().get("status"), Some(&json!("cancelled")));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            ChangeEvent::parse(r#"{"operation": "UPDATE", "entityType": "or"#),
            Err(PayloadError::Json(_))
        ));
        assert!(matches!(
            ChangeEvent::parse(r#"{"operation": "TRUNCATE", "entityType": "order", "record": {}}"#),
            Err(PayloadError::Json(_))
        ));
        assert!(matches!(
            ChangeEvent::parse(r#"{"operation": "INSERT", "entityType": "order", "record": [1, 2]}"#),
            Err(PayloadError::RecordNotObject)
        ));
        assert!(matches!(
            ChangeEvent::parse(r#"{"operation": "INSERT", "entityType": " ", "record": {"id": 1}}"#),
            Err(PayloadError::EmptyEntityType)
        ));
    }

    #[test]
    fn test_serializes_camel_case() {
        let event = ChangeEvent::new(
            Operation::Insert,
            "order",
            json!({"id": 1}),
            DateTime::from_timestamp(0, 0).unwrap(),
        )
        .unwrap();

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["operation"], "insert");
        assert_eq!(value["entityType"], "order");
        assert_eq!(value["record"]["id"], 1);
        assert!(value.get("occurredAt").is_some());
    }
}
