//! Event types for agent coordination
//!
//! An [`Event`] is the only thing that crosses component boundaries. Payloads
//! stay open JSON objects so agents can carry domain keys, but every event is
//! classified into an [`EventKind`] before the bus accepts it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ValidationError;

/// Subscribe to this event type to receive every event
pub const WILDCARD: &str = "*";

/// Payload keys with meaning to the kernel
pub const STATUS_KEY: &str = "status";
pub const REQUEST_ID_KEY: &str = "request_id";
pub const INSTANCE_ID_KEY: &str = "instance_id";
pub const DECISION_ID_KEY: &str = "decision_id";
pub const REASON_KEY: &str = "reason";

/// Event payload: always a JSON object
pub type Payload = Map<String, Value>;

/// A typed event published on the bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique, time-ordered event id
    pub id: String,
    /// Event type, e.g. `release_completed`
    pub event_type: String,
    /// Domain payload
    #[serde(default)]
    pub payload: Payload,
    /// Correlates a request with its response; used for deduplication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Publishing agent id
    pub source: String,
    /// When the event was created
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    /// Create a new event
    ///
    /// A string `request_id` inside the payload is adopted as the event's
    /// request id.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Payload) -> Self {
        let request_id = payload
            .get(REQUEST_ID_KEY)
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            id: Uuid::now_v7().to_string(),
            event_type: event_type.into(),
            payload,
            request_id,
            source: source.into(),
            emitted_at: Utc::now(),
        }
    }

    /// Create an event from arbitrary JSON data, which must be an object or null
    pub fn from_value(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: Value,
    ) -> Result<Self, ValidationError> {
        match data {
            Value::Object(map) => Ok(Self::new(event_type, source, map)),
            Value::Null => Ok(Self::new(event_type, source, Payload::new())),
            _ => Err(ValidationError::PayloadNotObject),
        }
    }

    /// Set the request id
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Insert a payload field
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// A string payload field
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// The payload `status`, if it is a string
    pub fn status(&self) -> Option<&str> {
        self.str_field(STATUS_KEY)
    }

    /// The workflow instance this event targets, if any
    pub fn instance_id(&self) -> Option<&str> {
        self.str_field(INSTANCE_ID_KEY)
    }

    /// Validate the event and classify it
    pub fn validate(&self) -> Result<EventKind, ValidationError> {
        if self.event_type.trim().is_empty() {
            return Err(ValidationError::EmptyEventType);
        }
        if self.event_type == WILDCARD {
            return Err(ValidationError::ReservedEventType);
        }
        if self.source.trim().is_empty() {
            return Err(ValidationError::EmptySource);
        }

        let lower = self.event_type.to_ascii_lowercase();
        let is_completed = lower.ends_with("_completed");
        let is_failed = lower.ends_with("_failed");

        if is_completed || is_failed {
            let status = match self.payload.get(STATUS_KEY) {
                None => {
                    return Err(ValidationError::MissingStatus {
                        event_type: self.event_type.clone(),
                    });
                }
                Some(Value::String(status)) => status.clone(),
                Some(_) => {
                    return Err(ValidationError::InvalidStatus {
                        event_type: self.event_type.clone(),
                    });
                }
            };
            return Ok(if is_completed {
                EventKind::Completed { status }
            } else {
                EventKind::Failed {
                    status,
                    reason: self.str_field(REASON_KEY).map(str::to_string),
                }
            });
        }

        if let Some(verdict) = self.status().and_then(Verdict::parse) {
            return Ok(EventKind::Decision { verdict });
        }

        if lower.ends_with("_requested") || lower.ends_with("_request") {
            return Ok(EventKind::Request);
        }

        Ok(EventKind::Notice)
    }
}

/// Category of an accepted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EventKind {
    /// Asks an agent to do something
    Request,
    /// Work finished; status is mandatory
    Completed { status: String },
    /// Work failed; status is mandatory
    Failed { status: String, reason: Option<String> },
    /// A human approval or rejection
    Decision { verdict: Verdict },
    /// Anything else
    Notice,
}

/// Outcome of a human decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approved,
    Rejected,
}

impl Verdict {
    /// Parse a payload status into a verdict
    pub fn parse(status: &str) -> Option<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            "approved" | "approve" | "granted" => Some(Self::Approved),
            "rejected" | "reject" | "denied" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, data: Value) -> Event {
        Event::from_value(event_type, "agent-a", data).unwrap()
    }

    #[test]
    fn test_completed_requires_status() {
        let err = event("release_completed", json!({})).validate().unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingStatus {
                event_type: "release_completed".to_string()
            }
        );

        let kind = event("release_completed", json!({"status": "completed"}))
            .validate()
            .unwrap();
        assert_eq!(
            kind,
            EventKind::Completed {
                status: "completed".to_string()
            }
        );
    }

    #[test]
    fn test_failed_suffix_is_case_insensitive() {
        let err = event("BUILD_FAILED", json!({"reason": "oom"})).validate().unwrap_err();
        assert!(matches!(err, ValidationError::MissingStatus { .. }));

        let kind = event("BUILD_FAILED", json!({"status": "failed", "reason": "oom"}))
            .validate()
            .unwrap();
        assert_eq!(
            kind,
            EventKind::Failed {
                status: "failed".to_string(),
                reason: Some("oom".to_string())
            }
        );
    }

    #[test]
    fn test_non_string_status_is_invalid() {
        let err = event("x_completed", json!({"status": 1})).validate().unwrap_err();
        assert!(matches!(err, ValidationError::InvalidStatus { .. }));
    }

    #[test]
    fn test_decision_and_request_classification() {
        let kind = event("release_approved", json!({"status": "Approved"})).validate().unwrap();
        assert_eq!(
            kind,
            EventKind::Decision {
                verdict: Verdict::Approved
            }
        );
        assert_eq!(event("build_requested", json!({})).validate().unwrap(), EventKind::Request);
        assert_eq!(event("heartbeat", Value::Null).validate().unwrap(), EventKind::Notice);
    }

    #[test]
    fn test_envelope_validation() {
        assert_eq!(
            event("  ", json!({})).validate().unwrap_err(),
            ValidationError::EmptyEventType
        );
        assert_eq!(
            event(WILDCARD, json!({})).validate().unwrap_err(),
            ValidationError::ReservedEventType
        );
        let anonymous = Event::new("x", "", Payload::new());
        assert_eq!(anonymous.validate().unwrap_err(), ValidationError::EmptySource);
        assert_eq!(
            Event::from_value("x", "a", json!([1, 2])).unwrap_err(),
            ValidationError::PayloadNotObject
        );
    }

    #[test]
    fn test_request_id_adopted_from_payload() {
        let e = event("build_requested", json!({"request_id": "r-1"}));
        assert_eq!(e.request_id.as_deref(), Some("r-1"));

        let e = event("build_requested", json!({})).with_request_id("r-2");
        assert_eq!(e.request_id.as_deref(), Some("r-2"));
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = event("x", json!({}));
        let b = event("x", json!({}));
        assert_ne!(a.id, b.id);
    }
}
