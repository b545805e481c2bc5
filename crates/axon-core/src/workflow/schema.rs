//! Workflow spec types.
//!
//! A workflow is a flat DAG of steps:
//!
//! ```yaml
//! name: "triage"
//! steps:
//!   - id: fetch
//!     action: fetch_code
//!     params: { path: "${input.path}" }
//!   - id: lint
//!     action: lint
//!     requires: [fetch]
//!     params: "${results.fetch}"
//!     retry: { max_attempts: 3, backoff: { initial_ms: 100, multiplier: 2.0 } }
//!     on_error: continue
//!   - id: report
//!     action: report
//!     requires: [lint]
//! outputs:
//!   issues: { step: lint, path: issues, transform: count }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::template::StepEnv;
use crate::error::AxonError;

/// Top-level workflow spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Steps in declaration order (ties in the topological order follow it)
    pub steps: Vec<StepSpec>,

    /// Named outputs computed after the run
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSpec>,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps: Vec::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn output(mut self, name: impl Into<String>, output: OutputSpec) -> Self {
        self.outputs.insert(name.into(), output);
        self
    }

    pub fn get_step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Parse a workflow spec from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, AxonError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AxonError::Configuration(format!("Failed to parse workflow YAML: {}", e)))
    }

    /// Load a workflow spec from a file path.
    pub fn from_file(path: &str) -> Result<Self, AxonError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AxonError::Configuration(format!("Failed to read workflow file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique within the workflow; used in `requires` and `${results.<id>}`
    pub id: String,

    /// Name of a registered action
    pub action: String,

    #[serde(default)]
    pub params: Params,

    #[serde(default)]
    pub requires: Vec<String>,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub on_error: OnError,

    /// Per-attempt deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            params: Params::default(),
            requires: Vec::new(),
            retry: RetryPolicy::default(),
            on_error: OnError::default(),
            timeout_ms: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Params::Value(params);
        self
    }

    /// Compute params from the execution environment at run time.
    pub fn with_dynamic_params<F>(mut self, f: F) -> Self
    where
        F: Fn(&StepEnv) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.params = Params::Dynamic(Arc::new(f));
        self
    }

    pub fn requires<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

pub type ParamsFn = Arc<dyn Fn(&StepEnv) -> Result<Value, String> + Send + Sync>;

/// Step parameters.
///
/// `Value` params may contain `${...}` templates anywhere in their strings;
/// they are resolved against the step environment before each attempt.
#[derive(Clone)]
pub enum Params {
    Value(Value),
    Dynamic(ParamsFn),
}

impl Default for Params {
    fn default() -> Self {
        Params::Value(Value::Null)
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Params::Value(v) => write!(f, "Params::Value({})", v),
            Params::Dynamic(_) => write!(f, "Params::Dynamic(<fn>)"),
        }
    }
}

impl Serialize for Params {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Params::Value(v) => v.serialize(serializer),
            Params::Dynamic(_) => serializer.serialize_str("<dynamic>"),
        }
    }
}

impl<'de> Deserialize<'de> for Params {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Params::Value)
    }
}

/// What happens once a step has used up its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Abort the execution (default)
    #[default]
    Halt,
    /// Record the failure, skip dependents, keep going
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, initial_ms: u64, multiplier: f64) -> Self {
        self.backoff = Backoff {
            initial_ms,
            multiplier,
        };
        self
    }

    /// Delay before attempt `failed_attempt + 1`, capped at `max`.
    pub fn delay_after(&self, failed_attempt: u32, max: Duration) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(32) as i32;
        let factor = self.backoff.multiplier.max(1.0).powi(exponent);
        let ms = (self.backoff.initial_ms as f64 * factor).min(max.as_millis() as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(default)]
    pub initial_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: 0,
            multiplier: default_multiplier(),
        }
    }
}

/// How one named output is computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    pub step: String,

    /// Dot path into the step result (`findings.0.severity`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default)]
    pub transform: OutputTransform,
}

impl OutputSpec {
    pub fn from_step(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            path: None,
            transform: OutputTransform::Identity,
        }
    }

    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn transform(mut self, transform: OutputTransform) -> Self {
        self.transform = transform;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputTransform {
    #[default]
    Identity,
    /// Length of an array, object or string
    Count,
    /// Keys of an object
    Keys,
    First,
    Last,
    /// JSON text of the value
    Stringify,
}

impl OutputTransform {
    pub fn apply(&self, value: &Value) -> Result<Value, String> {
        match (self, value) {
            (OutputTransform::Identity, v) => Ok(v.clone()),
            (OutputTransform::Count, Value::Array(a)) => Ok(Value::from(a.len())),
            (OutputTransform::Count, Value::Object(o)) => Ok(Value::from(o.len())),
            (OutputTransform::Count, Value::String(s)) => Ok(Value::from(s.chars().count())),
            (OutputTransform::Keys, Value::Object(o)) => {
                Ok(Value::Array(o.keys().cloned().map(Value::String).collect()))
            }
            (OutputTransform::First, Value::Array(a)) => Ok(a.first().cloned().unwrap_or(Value::Null)),
            (OutputTransform::Last, Value::Array(a)) => Ok(a.last().cloned().unwrap_or(Value::Null)),
            (OutputTransform::Stringify, v) => serde_json::to_string(v).map(Value::String).map_err(|e| e.to_string()),
            (t, v) => Err(format!(
                "transform {:?} does not apply to {}",
                t,
                crate::topics::schema::json_kind(v)
            )),
        }
    }
}
