//! Topic registry - named, schema-bound categories of signals.
//!
//! Every signal on the bus carries a wire type (`review.request`,
//! `review.result`, ...). The registry binds each wire type to a topic name
//! and a payload schema, and is the only place payloads get validated.
//!
//! Topics can be declared in YAML:
//!
//! ```yaml
//! - name: review_request
//!   wire_type: review.request
//!   schema:
//!     - { name: code, type: string, required: true }
//!     - { name: language, type: string, default: rust }
//! ```

pub mod schema;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AxonError;

pub use schema::{validate_fields, FieldSpec, FieldType};

/// A registered topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    /// Unique topic name (referenced by agent configurations)
    pub name: String,

    /// Identifier carried in the `type` field of signals
    pub wire_type: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Payload fields
    #[serde(default)]
    pub schema: Vec<FieldSpec>,
}

impl Topic {
    pub fn new(name: impl Into<String>, wire_type: impl Into<String>, schema: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            wire_type: wire_type.into(),
            description: None,
            schema,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Parse a list of topic declarations from YAML.
    pub fn list_from_yaml(yaml: &str) -> Result<Vec<Topic>, AxonError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AxonError::Configuration(format!("Failed to parse topics YAML: {}", e)))
    }

    /// Validate a payload against this topic's schema.
    pub fn validate(&self, payload: &Value) -> Result<Value, AxonError> {
        validate_fields(&self.schema, payload)
            .map_err(|e| AxonError::Validation(format!("topic '{}': {}", self.name, e)))
    }
}

#[derive(Default)]
struct RegistryInner {
    topics: HashMap<String, Arc<Topic>>,
    /// wire type → topic name
    by_wire_type: HashMap<String, String>,
}

/// Thread-safe registry of topics.
///
/// Registration takes the write lock for the duration of one call, so a
/// topic is visible to every reader as soon as `register` returns.
#[derive(Default)]
pub struct TopicRegistry {
    inner: RwLock<RegistryInner>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new topic.
    ///
    /// Fails with `AlreadyRegistered` when the name (or the wire type) is
    /// taken and with `Validation` when the schema is inconsistent.
    pub fn register(
        &self,
        name: &str,
        wire_type: &str,
        schema: Vec<FieldSpec>,
    ) -> Result<Arc<Topic>, AxonError> {
        self.register_topic(Topic::new(name, wire_type, schema))
    }

    /// Register a fully-built [`Topic`].
    pub fn register_topic(&self, topic: Topic) -> Result<Arc<Topic>, AxonError> {
        if topic.name.trim().is_empty() {
            return Err(AxonError::Validation("topic name must not be empty".to_string()));
        }
        if topic.wire_type.trim().is_empty() {
            return Err(AxonError::Validation(format!(
                "topic '{}': wire type must not be empty",
                topic.name
            )));
        }

        let mut seen = std::collections::HashSet::new();
        let mut fields = Vec::with_capacity(topic.schema.len());
        for field in &topic.schema {
            if !seen.insert(field.name.clone()) {
                return Err(AxonError::Validation(format!(
                    "topic '{}': duplicate field '{}'",
                    topic.name, field.name
                )));
            }
            fields.push(
                field
                    .normalized()
                    .map_err(|e| AxonError::Validation(format!("topic '{}': {}", topic.name, e)))?,
            );
        }

        let topic = Arc::new(Topic {
            schema: fields,
            ..topic
        });

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.topics.contains_key(&topic.name) {
            return Err(AxonError::AlreadyRegistered(format!("topic '{}'", topic.name)));
        }
        if let Some(owner) = inner.by_wire_type.get(&topic.wire_type) {
            return Err(AxonError::AlreadyRegistered(format!(
                "wire type '{}' is bound to topic '{}'",
                topic.wire_type, owner
            )));
        }
        inner
            .by_wire_type
            .insert(topic.wire_type.clone(), topic.name.clone());
        inner.topics.insert(topic.name.clone(), topic.clone());
        drop(inner);

        tracing::info!(
            "[TopicRegistry] Registered topic {} ({}) with {} field(s)",
            topic.name,
            topic.wire_type,
            topic.schema.len()
        );
        Ok(topic)
    }

    /// Get a topic by name.
    pub fn get(&self, name: &str) -> Result<Arc<Topic>, AxonError> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .topics
            .get(name)
            .cloned()
            .ok_or_else(|| AxonError::NotFound(format!("topic '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .topics
            .contains_key(name)
    }

    /// All topics, sorted by name.
    pub fn list(&self) -> Vec<Arc<Topic>> {
        let mut topics: Vec<Arc<Topic>> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .topics
            .values()
            .cloned()
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        topics
    }

    /// Map a wire type back to its topic name.
    pub fn resolve_wire_type(&self, wire_type: &str) -> Result<String, AxonError> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_wire_type
            .get(wire_type)
            .cloned()
            .ok_or_else(|| AxonError::NotFound(format!("no topic for wire type '{}'", wire_type)))
    }

    /// Validate a payload against the named topic and return it normalized.
    pub fn validate(&self, name: &str, payload: &Value) -> Result<Value, AxonError> {
        self.get(name)?.validate(payload)
    }

    /// Resolve a wire type and validate its payload in one lookup.
    pub fn validate_wire(&self, wire_type: &str, payload: &Value) -> Result<(Arc<Topic>, Value), AxonError> {
        let topic = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let name = inner.by_wire_type.get(wire_type).ok_or_else(|| {
                AxonError::NotFound(format!("no topic for wire type '{}'", wire_type))
            })?;
            inner
                .topics
                .get(name)
                .cloned()
                .ok_or_else(|| AxonError::Internal(format!("dangling wire type '{}'", wire_type)))?
        };
        let normalized = topic.validate(payload)?;
        Ok((topic, normalized))
    }
}
