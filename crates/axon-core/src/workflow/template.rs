//! Template resolution for step params.
//!
//! Supported references:
//! - `${input}` / `${input.<path>}` - the workflow input
//! - `${results.<step>}` / `${results.<step>.<path>}` - output of a finished step
//! - `${context.<key>}` - the invocation context
//! - `${step.id}` - id of the step being resolved
//! - `${workflow.name}` - name of the running workflow
//!
//! A string that is exactly one reference is replaced by the referenced JSON
//! value. References embedded in longer strings are interpolated as text.
//! Anything else in `${...}` (for example an environment variable name) is
//! left untouched.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Everything a step can see while its params are resolved.
#[derive(Debug, Clone)]
pub struct StepEnv {
    pub input: Value,
    pub results: BTreeMap<String, Value>,
    pub context: Value,
    pub step_id: String,
    pub workflow_name: String,
}

impl StepEnv {
    /// Resolve a dotted reference such as `results.fetch.files.0`.
    ///
    /// Returns `Ok(None)` for roots this module does not own.
    pub fn lookup(&self, reference: &str) -> Result<Option<Value>, String> {
        let (root, rest) = match reference.split_once('.') {
            Some((root, rest)) => (root, Some(rest)),
            None => (reference, None),
        };

        let found = match (root, rest) {
            ("input", None) => Some(self.input.clone()),
            ("input", Some(path)) => lookup_path(&self.input, path).cloned(),
            ("results", None) => Some(Value::Object(
                self.results
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Map<String, Value>>(),
            )),
            ("results", Some(path)) => {
                let (step, sub) = match path.split_once('.') {
                    Some((step, sub)) => (step, Some(sub)),
                    None => (path, None),
                };
                match (self.results.get(step), sub) {
                    (Some(v), None) => Some(v.clone()),
                    (Some(v), Some(sub)) => lookup_path(v, sub).cloned(),
                    (None, _) => None,
                }
            }
            ("context", None) => Some(self.context.clone()),
            ("context", Some(path)) => lookup_path(&self.context, path).cloned(),
            ("step", Some("id")) => Some(Value::String(self.step_id.clone())),
            ("workflow", Some("name")) => Some(Value::String(self.workflow_name.clone())),
            _ => return Ok(None),
        };

        found
            .map(Some)
            .ok_or_else(|| format!("unresolved reference '${{{}}}'", reference))
    }
}

/// Follow a dot path through objects and arrays (numeric segments index arrays).
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Resolve every template inside `value`, recursing through arrays and objects.
pub fn resolve_value(value: &Value, env: &StepEnv) -> Result<Value, String> {
    match value {
        Value::String(s) => resolve_str(s, env),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, env)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Resolve templates in a single string.
pub fn resolve_str(template: &str, env: &StepEnv) -> Result<Value, String> {
    if !template.contains("${") {
        return Ok(Value::String(template.to_string()));
    }

    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| e.to_string())?;

    // Whole-string reference keeps the JSON type.
    if let Some(caps) = re.captures(template) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(template.len()) {
            let reference = caps[1].trim();
            return match env.lookup(reference)? {
                Some(v) => Ok(v),
                None => Ok(Value::String(template.to_string())),
            };
        }
    }

    let mut error = None;
    let out = re.replace_all(template, |caps: &regex::Captures| {
        let reference = caps[1].trim();
        match env.lookup(reference) {
            Ok(Some(Value::String(s))) => s,
            Ok(Some(v)) => v.to_string(),
            Ok(None) => caps[0].to_string(),
            Err(e) => {
                error.get_or_insert(e);
                String::new()
            }
        }
    });

    match error {
        Some(e) => Err(e),
        None => Ok(Value::String(out.into_owned())),
    }
}
