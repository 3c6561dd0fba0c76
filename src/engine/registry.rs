use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use super::ExecutionEngine;

#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub id: String,
    pub name: String,
}

/// Maps application names to the engine that serves them.
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn ExecutionEngine>>,
    default_app: String,
}

impl EngineRegistry {
    pub fn new(default_app: impl Into<String>) -> Self {
        Self {
            engines: HashMap::new(),
            default_app: default_app.into(),
        }
    }

    /// Register an engine under its own id.
    pub fn register(&mut self, engine: Arc<dyn ExecutionEngine>) {
        self.engines.insert(engine.id().to_string(), engine);
    }

    /// Register an engine under an explicit application name.
    pub fn register_as(&mut self, app: impl Into<String>, engine: Arc<dyn ExecutionEngine>) {
        self.engines.insert(app.into(), engine);
    }

    pub fn list(&self) -> Vec<EngineInfo> {
        let mut list: Vec<_> = self
            .engines
            .iter()
            .map(|(app, engine)| EngineInfo {
                id: app.clone(),
                name: engine.name().to_string(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn get(&self, app: &str) -> Option<Arc<dyn ExecutionEngine>> {
        self.engines.get(app).cloned()
    }

    pub fn default_engine(&self) -> Option<Arc<dyn ExecutionEngine>> {
        self.get(&self.default_app)
    }

    pub fn default_app(&self) -> &str {
        &self.default_app
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::echo::EchoEngine;
    use crate::engine::scripted::ScriptedEngine;

    #[test]
    fn list_is_sorted_by_app() {
        let mut registry = EngineRegistry::new("echo");
        registry.register(Arc::new(EchoEngine::new()));
        registry.register_as("approvals", Arc::new(ScriptedEngine::new(vec![])));

        let ids: Vec<_> = registry.list().into_iter().map(|info| info.id).collect();
        assert_eq!(ids, vec!["approvals".to_string(), "echo".to_string()]);
        assert!(registry.default_engine().is_some());
        assert!(registry.get("missing").is_none());
    }
}
