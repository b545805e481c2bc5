//! Field-level schema for topic payloads.
//!
//! A topic schema is a flat list of fields:
//!
//! ```yaml
//! - name: severity
//!   type: string
//!   required: true
//!   enum: [low, medium, high, critical]
//! - name: retries
//!   type: integer
//!   default: 0
//! ```
//!
//! Validation checks the payload against each declared field, fills in
//! defaults and normalizes numbers (`float` fields always carry floats).
//! Fields the schema does not mention pass through untouched, so
//! normalizing an already-normalized payload is a no-op.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Declared JSON type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        }
    }

    /// Check `value` against this type and return its normalized form.
    pub fn coerce(&self, value: &Value) -> Result<Value, String> {
        match (self, value) {
            (FieldType::Any, v) => Ok(v.clone()),
            (FieldType::String, Value::String(_)) => Ok(value.clone()),
            (FieldType::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (FieldType::Object, Value::Object(_)) => Ok(value.clone()),
            (FieldType::Array, Value::Array(_)) => Ok(value.clone()),
            (FieldType::Integer, Value::Number(n)) => {
                if n.is_i64() || n.is_u64() {
                    return Ok(value.clone());
                }
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Ok(Value::from(f as i64))
                    }
                    _ => Err(format!("expected integer, got {}", n)),
                }
            }
            (FieldType::Float, Value::Number(n)) => n
                .as_f64()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("expected float, got {}", n)),
            (expected, other) => Err(format!(
                "expected {}, got {}",
                expected.as_str(),
                json_kind(other)
            )),
        }
    }
}

/// One declared field of a topic schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,

    #[serde(rename = "type", default)]
    pub field_type: FieldType,

    #[serde(default)]
    pub required: bool,

    /// Value inserted when the field is absent or null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Allowed values (after normalization).
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            default: None,
            allowed: None,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            default: None,
            allowed: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Check that the declaration is self-consistent and normalize its
    /// default and enum values.
    pub(crate) fn normalized(&self) -> Result<FieldSpec, String> {
        if self.name.trim().is_empty() {
            return Err("field name must not be empty".to_string());
        }

        let allowed = match &self.allowed {
            Some(values) => {
                let mut out = Vec::with_capacity(values.len());
                for v in values {
                    out.push(self.field_type.coerce(v).map_err(|e| {
                        format!("field '{}': enum value {}: {}", self.name, v, e)
                    })?);
                }
                Some(out)
            }
            None => None,
        };

        let default = match &self.default {
            Some(v) => {
                let normalized = self
                    .field_type
                    .coerce(v)
                    .map_err(|e| format!("field '{}': default {}: {}", self.name, v, e))?;
                if let Some(allowed) = &allowed {
                    if !allowed.contains(&normalized) {
                        return Err(format!(
                            "field '{}': default {} is not one of the allowed values",
                            self.name, v
                        ));
                    }
                }
                Some(normalized)
            }
            None => None,
        };

        Ok(FieldSpec {
            name: self.name.clone(),
            field_type: self.field_type,
            required: self.required,
            default,
            allowed,
        })
    }
}

/// Validate a payload against a list of fields.
///
/// Returns the normalized payload, or every problem found joined into one
/// message.
pub fn validate_fields(fields: &[FieldSpec], payload: &Value) -> Result<Value, String> {
    let object = match payload {
        Value::Object(map) => map,
        other => return Err(format!("payload must be an object, got {}", json_kind(other))),
    };

    let mut normalized: Map<String, Value> = object.clone();
    let mut problems: Vec<String> = Vec::new();

    for field in fields {
        let present = object.get(&field.name).filter(|v| !v.is_null());

        let value = match (present, &field.default) {
            (Some(v), _) => v.clone(),
            (None, Some(default)) => default.clone(),
            (None, None) => {
                if field.required {
                    problems.push(format!("missing required field '{}'", field.name));
                }
                continue;
            }
        };

        let coerced = match field.field_type.coerce(&value) {
            Ok(v) => v,
            Err(e) => {
                problems.push(format!("field '{}': {}", field.name, e));
                continue;
            }
        };

        if let Some(allowed) = &field.allowed {
            if !allowed.contains(&coerced) {
                problems.push(format!(
                    "field '{}': {} is not one of [{}]",
                    field.name,
                    coerced,
                    allowed
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
                continue;
            }
        }

        normalized.insert(field.name.clone(), coerced);
    }

    if problems.is_empty() {
        Ok(Value::Object(normalized))
    } else {
        Err(problems.join("; "))
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn review_fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::required("code", FieldType::String),
            FieldSpec::optional("language", FieldType::String).with_default(json!("rust")),
            FieldSpec::optional("score", FieldType::Float),
            FieldSpec::optional("severity", FieldType::String).one_of(["low", "high"]),
        ]
    }

    #[test]
    fn test_defaults_and_normalization() {
        let out = validate_fields(&review_fields(), &json!({"code": "fn main() {}", "score": 3}))
            .unwrap();
        assert_eq!(out["language"], "rust");
        assert!(out["score"].is_f64());
        assert_eq!(out["score"].as_f64(), Some(3.0));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let payload = json!({"code": "x", "score": 7, "extra": [1, 2]});
        let once = validate_fields(&review_fields(), &payload).unwrap();
        let twice = validate_fields(&review_fields(), &once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice["extra"], json!([1, 2]));
    }

    #[test]
    fn test_collects_all_problems() {
        let err = validate_fields(&review_fields(), &json!({"score": "high", "severity": "mid"}))
            .unwrap_err();
        assert!(err.contains("missing required field 'code'"));
        assert!(err.contains("field 'score'"));
        assert!(err.contains("field 'severity'"));
    }

    #[test]
    fn test_null_treated_as_missing() {
        let out = validate_fields(&review_fields(), &json!({"code": "x", "language": null})).unwrap();
        assert_eq!(out["language"], "rust");
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let err = validate_fields(&review_fields(), &json!([1, 2, 3])).unwrap_err();
        assert!(err.contains("payload must be an object"));
    }

    #[test]
    fn test_integer_accepts_whole_floats() {
        assert_eq!(FieldType::Integer.coerce(&json!(4.0)).unwrap(), json!(4));
        assert!(FieldType::Integer.coerce(&json!(4.5)).is_err());
    }

    #[test]
    fn test_normalized_rejects_default_outside_enum() {
        let field = FieldSpec::optional("severity", FieldType::String)
            .one_of(["low", "high"])
            .with_default(json!("medium"));
        assert!(field.normalized().is_err());
    }
}
