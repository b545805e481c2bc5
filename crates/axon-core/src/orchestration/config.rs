//! Agent configurations - declarative specialists and orchestrators.
//!
//! ```yaml
//! - id: security
//!   type: specialist
//!   actions: [scan_secrets, rate_severity]
//!   signals:
//!     subscribes: [review_request]
//!     emits: [review_result]
//!   state_schema:
//!     - { name: reviewed, type: integer, default: 0 }
//!
//! - id: reviewer
//!   type: orchestrator
//!   signals:
//!     subscribes: [review_request, review_result]
//!     emits: [review_summary]
//!     roles: { request: review_request, result: review_result, summary: review_summary }
//!   orchestration:
//!     classify_fn: default
//!     spawn_specialists:
//!       security: [security, performance]
//!       trivial: []
//!     aggregation_fn: severity
//!     negotiate_fn: severity
//!     timeout_ms: 30000
//! ```
//!
//! String values may reference environment variables as `${NAME}` or
//! `${NAME:-fallback}`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::strategy::{StrategyRegistry, DEFAULT_STRATEGY};
use crate::agents::AgentKind;
use crate::error::AxonError;
use crate::topics::{FieldSpec, TopicRegistry};
use crate::workflow::{ActionRegistry, RetryPolicy};

pub const ROLE_REQUEST: &str = "request";
pub const ROLE_RESULT: &str = "result";
pub const ROLE_SUMMARY: &str = "summary";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: AgentKind,

    #[serde(default)]
    pub description: Option<String>,

    /// Action names run, in order, when the agent fires
    #[serde(default)]
    pub actions: Vec<String>,

    #[serde(default)]
    pub signals: SignalBindings,

    /// Orchestrator-only block
    #[serde(default)]
    pub orchestration: Option<OrchestrationSpec>,

    /// Typed state keys with defaults
    #[serde(default)]
    pub state_schema: Vec<FieldSpec>,

    /// Retry policy applied to each action
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalBindings {
    #[serde(default)]
    pub subscribes: Vec<String>,

    #[serde(default)]
    pub emits: Vec<String>,

    /// role (`request`, `result`, `summary`) → topic name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationSpec {
    #[serde(default = "default_strategy")]
    pub classify_fn: String,

    #[serde(default)]
    pub spawn_specialists: Option<SpawnSpecialists>,

    #[serde(default = "default_strategy")]
    pub aggregation_fn: String,

    #[serde(default = "default_strategy")]
    pub negotiate_fn: String,

    /// Retry policy for the classification step
    #[serde(default)]
    pub classify_retry: RetryPolicy,

    /// Overrides `orchestration.task_timeout_ms` from the runtime settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_strategy() -> String {
    DEFAULT_STRATEGY.to_string()
}

impl Default for OrchestrationSpec {
    fn default() -> Self {
        Self {
            classify_fn: default_strategy(),
            spawn_specialists: None,
            aggregation_fn: default_strategy(),
            negotiate_fn: default_strategy(),
            classify_retry: RetryPolicy::default(),
            timeout_ms: None,
        }
    }
}

/// Which specialists an orchestrator spawns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpawnSpecialists {
    /// Same set for every request
    Static(Vec<String>),
    /// classification label → set; the `default` key covers other labels
    ByLabel(BTreeMap<String, Vec<String>>),
}

impl SpawnSpecialists {
    pub fn for_label(&self, label: &str) -> Vec<String> {
        match self {
            SpawnSpecialists::Static(list) => list.clone(),
            SpawnSpecialists::ByLabel(map) => map
                .get(label)
                .or_else(|| map.get(DEFAULT_STRATEGY))
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub(crate) fn all_ids(&self) -> Vec<&String> {
        match self {
            SpawnSpecialists::Static(list) => list.iter().collect(),
            SpawnSpecialists::ByLabel(map) => map.values().flatten().collect(),
        }
    }
}

impl AgentConfig {
    pub fn specialist(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: AgentKind::Specialist,
            description: None,
            actions: Vec::new(),
            signals: SignalBindings::default(),
            orchestration: None,
            state_schema: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn orchestrator(id: impl Into<String>, orchestration: OrchestrationSpec) -> Self {
        Self {
            kind: AgentKind::Orchestrator,
            orchestration: Some(orchestration),
            ..Self::specialist(id)
        }
    }

    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn subscribes<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.signals.subscribes = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn emits<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.signals.emits = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_role(mut self, role: &str, topic: &str) -> Self {
        self.signals
            .roles
            .get_or_insert_with(BTreeMap::new)
            .insert(role.to_string(), topic.to_string());
        self
    }

    pub fn with_state_schema(mut self, fields: Vec<FieldSpec>) -> Self {
        self.state_schema = fields;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Parse one or more configurations from YAML.
    ///
    /// Accepts a list, a single mapping, or a mapping with an `agents` list.
    pub fn list_from_yaml(yaml: &str) -> Result<Vec<AgentConfig>, AxonError> {
        let parse_err = |e: serde_yaml::Error| {
            AxonError::Configuration(format!("Failed to parse agent YAML: {}", e))
        };
        let mut doc: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(parse_err)?;
        expand_env(&mut doc);

        let doc = match doc {
            serde_yaml::Value::Mapping(mut map) => {
                match map.remove(serde_yaml::Value::String("agents".to_string())) {
                    Some(list) => list,
                    None => serde_yaml::Value::Sequence(vec![serde_yaml::Value::Mapping(map)]),
                }
            }
            serde_yaml::Value::Null => serde_yaml::Value::Sequence(Vec::new()),
            other => other,
        };
        serde_yaml::from_value(doc).map_err(parse_err)
    }

    /// Load configurations from a YAML file.
    pub fn list_from_file(path: &str) -> Result<Vec<AgentConfig>, AxonError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AxonError::Configuration(format!("Failed to read agent file '{}': {}", path, e))
        })?;
        Self::list_from_yaml(&content)
    }

    /// Load every `*.yaml` / `*.yml` file of a directory, in file-name order.
    pub fn load_dir(dir: &str) -> Result<Vec<AgentConfig>, AxonError> {
        let dir_path = Path::new(dir);
        if !dir_path.is_dir() {
            return Err(AxonError::Configuration(format!(
                "Agent directory '{}' does not exist",
                dir
            )));
        }

        let mut files = Vec::new();
        for ext in ["yaml", "yml"] {
            let pattern = dir_path.join(format!("*.{}", ext));
            let pattern = pattern.to_string_lossy();
            let paths = glob::glob(&pattern).map_err(|e| {
                AxonError::Configuration(format!("Bad agent file pattern '{}': {}", pattern, e))
            })?;
            for entry in paths {
                let path = entry.map_err(|e| {
                    AxonError::Configuration(format!("Directory entry error: {}", e))
                })?;
                files.push(path);
            }
        }
        files.sort();

        let mut configs = Vec::new();
        for path in files {
            let loaded = Self::list_from_file(&path.to_string_lossy())?;
            for config in &loaded {
                tracing::info!(
                    "[Runtime] Loaded {} config: {} ({})",
                    config.kind.as_str(),
                    config.id,
                    path.display()
                );
            }
            configs.extend(loaded);
        }
        Ok(configs)
    }

    /// Every topic named by this configuration.
    fn referenced_topics(&self) -> Vec<&String> {
        let mut topics: Vec<&String> = self
            .signals
            .subscribes
            .iter()
            .chain(self.signals.emits.iter())
            .collect();
        if let Some(roles) = &self.signals.roles {
            topics.extend(roles.values());
        }
        topics
    }
}

/// Expand `${NAME}` / `${NAME:-fallback}` in every string of a YAML tree.
fn expand_env(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::String(s) if s.contains("${") => {
            *s = expand_env_str(s);
        }
        serde_yaml::Value::Sequence(items) => items.iter_mut().for_each(expand_env),
        serde_yaml::Value::Mapping(map) => map.iter_mut().for_each(|(_, v)| expand_env(v)),
        _ => {}
    }
}

pub(crate) fn expand_env_str(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        match (std::env::var(&caps[1]), caps.get(2)) {
            (Ok(v), _) => v,
            (Err(_), Some(fallback)) => fallback.as_str().to_string(),
            (Err(_), None) => caps[0].to_string(),
        }
    })
    .to_string()
}

// ─── Validation ────────────────────────────────────────────────────────────

/// A topic role bound to its wire type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleBinding {
    pub topic: String,
    pub wire_type: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedRoles {
    pub request: RoleBinding,
    pub result: RoleBinding,
    /// Orchestrators only
    pub summary: Option<RoleBinding>,
}

/// A validated configuration, ready to run.
#[derive(Debug, Clone)]
pub struct ResolvedAgent {
    pub config: Arc<AgentConfig>,
    pub roles: ResolvedRoles,
}

impl ResolvedAgent {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn orchestration(&self) -> OrchestrationSpec {
        self.config.orchestration.clone().unwrap_or_default()
    }
}

/// Validate a full configuration set against the registries.
///
/// The whole set is checked before anything is returned; the first problem
/// found is reported as a `Configuration` error.
pub fn resolve_configs(
    configs: &[AgentConfig],
    topics: &TopicRegistry,
    actions: &ActionRegistry,
    strategies: &StrategyRegistry,
) -> Result<Vec<ResolvedAgent>, AxonError> {
    let mut seen = HashSet::new();
    for config in configs {
        if config.id.trim().is_empty() {
            return Err(AxonError::Configuration("agent id must not be empty".to_string()));
        }
        if !seen.insert(config.id.as_str()) {
            return Err(AxonError::Configuration(format!("duplicate agent id '{}'", config.id)));
        }
    }

    let kinds: HashMap<&str, AgentKind> = configs.iter().map(|c| (c.id.as_str(), c.kind)).collect();

    let mut resolved = Vec::with_capacity(configs.len());
    for config in configs {
        let fail = |msg: String| AxonError::Configuration(format!("agent '{}': {}", config.id, msg));

        for topic in config.referenced_topics() {
            if !topics.contains(topic) {
                return Err(fail(format!("unknown topic '{}'", topic)));
            }
        }

        for action in &config.actions {
            if !actions.contains(action) {
                return Err(fail(format!("unknown action '{}'", action)));
            }
        }

        for field in &config.state_schema {
            field
                .normalized()
                .map_err(|e| fail(format!("state_schema: {}", e)))?;
        }

        let roles = resolve_roles(config, topics).map_err(fail)?;

        match config.kind {
            AgentKind::Specialist => {
                if config.actions.is_empty() {
                    return Err(fail("a specialist needs at least one action".to_string()));
                }
                if config.orchestration.is_some() {
                    return Err(fail("only orchestrators take an orchestration block".to_string()));
                }
            }
            AgentKind::Orchestrator => {
                let spec = config.orchestration.clone().unwrap_or_default();
                for name in [&spec.classify_fn, &spec.aggregation_fn, &spec.negotiate_fn] {
                    if !strategies.contains(name) {
                        return Err(fail(format!("unknown strategy '{}'", name)));
                    }
                }
                if let Some(spawn) = &spec.spawn_specialists {
                    for id in spawn.all_ids() {
                        match kinds.get(id.as_str()) {
                            Some(AgentKind::Specialist) => {}
                            Some(AgentKind::Orchestrator) => {
                                return Err(fail(format!("'{}' is an orchestrator, not a specialist", id)))
                            }
                            None => return Err(fail(format!("unknown specialist '{}'", id))),
                        }
                    }
                }
            }
        }

        resolved.push(ResolvedAgent {
            config: Arc::new(config.clone()),
            roles,
        });
    }

    for orchestrator in &resolved {
        let Some(spawn) = orchestrator
            .config
            .orchestration
            .as_ref()
            .and_then(|o| o.spawn_specialists.as_ref())
        else {
            continue;
        };
        for id in spawn.all_ids() {
            let Some(specialist) = resolved.iter().find(|r| r.id() == id.as_str()) else {
                continue;
            };
            if specialist.roles.result.topic != orchestrator.roles.result.topic {
                return Err(AxonError::Configuration(format!(
                    "agent '{}': specialist '{}' reports on '{}', not '{}'",
                    orchestrator.id(),
                    id,
                    specialist.roles.result.topic,
                    orchestrator.roles.result.topic
                )));
            }
        }
    }
    Ok(resolved)
}

fn resolve_roles(config: &AgentConfig, topics: &TopicRegistry) -> Result<ResolvedRoles, String> {
    let signals = &config.signals;
    let own: Vec<&String> = signals.subscribes.iter().chain(signals.emits.iter()).collect();

    let mut roles: BTreeMap<String, String> = BTreeMap::new();
    match &signals.roles {
        Some(explicit) => {
            for (role, topic) in explicit {
                if ![ROLE_REQUEST, ROLE_RESULT, ROLE_SUMMARY].contains(&role.as_str()) {
                    return Err(format!("unknown role '{}'", role));
                }
                if !own.contains(&topic) {
                    return Err(format!(
                        "role '{}' references topic '{}' outside subscribes/emits",
                        role, topic
                    ));
                }
                roles.insert(role.clone(), topic.clone());
            }
        }
        None => {
            for role in [ROLE_REQUEST, ROLE_RESULT, ROLE_SUMMARY] {
                if let Some(topic) = own.iter().find(|t| t.ends_with(role)) {
                    roles.insert(role.to_string(), (*topic).clone());
                }
            }
        }
    }

    // positional fallbacks
    let orchestrator = config.kind == AgentKind::Orchestrator;
    if !roles.contains_key(ROLE_REQUEST) {
        if let Some(t) = signals.subscribes.first() {
            roles.insert(ROLE_REQUEST.to_string(), t.clone());
        }
    }
    if !roles.contains_key(ROLE_RESULT) {
        let candidate = if orchestrator {
            signals.subscribes.iter().find(|t| Some(*t) != roles.get(ROLE_REQUEST))
        } else {
            signals.emits.first()
        };
        if let Some(t) = candidate {
            roles.insert(ROLE_RESULT.to_string(), t.clone());
        }
    }
    if orchestrator && !roles.contains_key(ROLE_SUMMARY) {
        if let Some(t) = signals.emits.first() {
            roles.insert(ROLE_SUMMARY.to_string(), t.clone());
        }
    }

    let bind = |role: &str| -> Result<RoleBinding, String> {
        let topic = roles
            .get(role)
            .ok_or_else(|| format!("cannot determine the '{}' topic", role))?;
        let wire_type = topics.get(topic).map_err(|e| e.to_string())?.wire_type.clone();
        Ok(RoleBinding {
            topic: topic.clone(),
            wire_type,
        })
    };

    let request = bind(ROLE_REQUEST)?;
    let result = bind(ROLE_RESULT)?;

    if orchestrator {
        let summary = bind(ROLE_SUMMARY)?;
        if !signals.subscribes.contains(&request.topic) || !signals.subscribes.contains(&result.topic) {
            return Err("an orchestrator must subscribe to its request and result topics".to_string());
        }
        if !signals.emits.contains(&summary.topic) {
            return Err("an orchestrator must emit its summary topic".to_string());
        }
        if request.topic == result.topic {
            return Err("request and result roles must use different topics".to_string());
        }
        Ok(ResolvedRoles {
            request,
            result,
            summary: Some(summary),
        })
    } else {
        if !signals.subscribes.contains(&request.topic) {
            return Err("a specialist must subscribe to its request topic".to_string());
        }
        if !signals.emits.contains(&result.topic) {
            return Err("a specialist must emit its result topic".to_string());
        }
        Ok(ResolvedRoles {
            request,
            result,
            summary: None,
        })
    }
}
