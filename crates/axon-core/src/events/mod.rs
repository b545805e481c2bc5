//! Signals and the typed publish/subscribe bus.
//!
//! A [`Signal`] is the unit of data moving between components. Its `type`
//! must resolve to a registered topic, and its `data` is validated against
//! that topic's schema before any subscriber sees it.

pub mod bus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AxonError;

pub use bus::{
    handler_fn, DeliveryFailure, DeliveryReport, DispatchMode, DispatchTarget, EventBus,
    SignalHandler, SubscriptionInfo,
};

/// A typed, schema-validated event.
///
/// Fields are private: a signal is built once (through `new` and the
/// `with_*` builders) and read afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    id: String,
    #[serde(rename = "type")]
    wire_type: String,
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    time: DateTime<Utc>,
    data: Value,
}

impl Signal {
    pub fn new(wire_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            wire_type: wire_type.into(),
            source: "axon".to_string(),
            subject: None,
            time: Utc::now(),
            data,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn wire_type(&self) -> &str {
        &self.wire_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// The task correlation key: the subject when present, the id otherwise.
    pub fn correlation_id(&self) -> &str {
        self.subject.as_deref().unwrap_or(&self.id)
    }

    /// Parse a signal from its JSON wire form.
    pub fn from_json(json: &str) -> Result<Self, AxonError> {
        serde_json::from_str(json)
            .map_err(|e| AxonError::Validation(format!("malformed signal: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, AxonError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Swap in the schema-normalized payload. Only the bus does this, before
    /// the signal reaches any subscriber.
    pub(crate) fn with_normalized_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let signal = Signal::new("review.request", json!({"code": "x"}))
            .with_source("tests")
            .with_subject("task-1");
        let value: Value = serde_json::from_str(&signal.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "review.request");
        assert_eq!(value["source"], "tests");
        assert_eq!(value["subject"], "task-1");
        assert_eq!(value["data"]["code"], "x");
        assert!(value["id"].as_str().is_some());
        assert!(value["time"].as_str().is_some());
    }

    #[test]
    fn test_round_trip_and_correlation() {
        let signal = Signal::new("review.request", json!({}));
        let parsed = Signal::from_json(&signal.to_json().unwrap()).unwrap();
        assert_eq!(parsed, signal);
        assert_eq!(parsed.correlation_id(), parsed.id());

        let with_subject = signal.with_subject("abc");
        assert_eq!(with_subject.correlation_id(), "abc");
    }

    #[test]
    fn test_malformed_signal() {
        assert!(matches!(
            Signal::from_json("{\"type\": 1}"),
            Err(AxonError::Validation(_))
        ));
    }
}
