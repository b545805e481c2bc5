//! Actions - the named units of work a workflow step invokes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use super::template::StepEnv;
use crate::error::AxonError;

/// A step implementation. Failures are plain messages; the engine wraps them
/// with the step id and attempt count.
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, params: Value, env: &StepEnv) -> Result<Value, String>;
}

struct FnAction<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(Value, StepEnv) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    async fn run(&self, params: Value, env: &StepEnv) -> Result<Value, String> {
        (self.f)(params, env.clone()).await
    }
}

/// Wrap an async closure as an [`Action`].
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn Action>
where
    F: Fn(Value, StepEnv) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    Arc::new(FnAction { f })
}

/// Name → action lookup shared by the workflow engine and agent configs.
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Arc<dyn Action>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, action: Arc<dyn Action>) -> Result<(), AxonError> {
        let mut actions = self.actions.write().unwrap_or_else(PoisonError::into_inner);
        if actions.contains_key(name) {
            return Err(AxonError::AlreadyRegistered(format!("action '{}'", name)));
        }
        actions.insert(name.to_string(), action);
        tracing::debug!("[Workflow] Registered action {}", name);
        Ok(())
    }

    /// Register an async closure under `name`.
    pub fn register_fn<F, Fut>(&self, name: &str, f: F) -> Result<(), AxonError>
    where
        F: Fn(Value, StepEnv) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.register(name, action_fn(f))
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Action>, AxonError> {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| AxonError::NotFound(format!("action '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_run() {
        let registry = ActionRegistry::new();
        registry
            .register_fn("echo", |params, env| async move {
                Ok(json!({"params": params, "step": env.step_id}))
            })
            .unwrap();

        let env = StepEnv {
            input: Value::Null,
            results: Default::default(),
            context: Value::Null,
            step_id: "s1".to_string(),
            workflow_name: "wf".to_string(),
        };
        let out = registry.get("echo").unwrap().run(json!(1), &env).await.unwrap();
        assert_eq!(out, json!({"params": 1, "step": "s1"}));
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[test]
    fn test_duplicate_and_missing() {
        let registry = ActionRegistry::new();
        registry.register_fn("a", |_, _| async { Ok(Value::Null) }).unwrap();
        assert!(matches!(
            registry.register_fn("a", |_, _| async { Ok(Value::Null) }),
            Err(AxonError::AlreadyRegistered(_))
        ));
        assert!(matches!(registry.get("b"), Err(AxonError::NotFound(_))));
    }
}
