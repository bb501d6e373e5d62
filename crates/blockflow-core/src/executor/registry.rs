use std::collections::HashMap;
use std::sync::Arc;

use super::{ConditionExecutor, EdgeExecutor};
use crate::error::ConfigError;
use crate::model::EdgeKind;

/// Edge kind to executor table. Built once and shared by `Arc`; never mutated afterwards.
pub struct EdgeRegistry {
    executors: HashMap<EdgeKind, Arc<dyn EdgeExecutor>>,
}

impl EdgeRegistry {
    /// Starts a builder. The `condition` executor is always included.
    pub fn builder() -> EdgeRegistryBuilder {
        EdgeRegistryBuilder::default()
    }

    pub fn get(&self, kind: EdgeKind) -> Option<Arc<dyn EdgeExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn contains(&self, kind: EdgeKind) -> bool {
        self.executors.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<EdgeKind> {
        let mut kinds: Vec<_> = self.executors.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for EdgeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[derive(Default)]
pub struct EdgeRegistryBuilder {
    executors: Vec<Arc<dyn EdgeExecutor>>,
}

impl EdgeRegistryBuilder {
    pub fn register(mut self, executor: Arc<dyn EdgeExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Builds the registry, rejecting a second executor for the same kind.
    pub fn build(self) -> Result<EdgeRegistry, ConfigError> {
        let mut executors: HashMap<EdgeKind, Arc<dyn EdgeExecutor>> = HashMap::new();
        for executor in self.executors {
            let kind = executor.kind();
            if executors.insert(kind, executor).is_some() {
                return Err(ConfigError::DuplicateExecutor(kind));
            }
        }
        executors
            .entry(EdgeKind::Condition)
            .or_insert_with(|| Arc::new(ConditionExecutor));
        Ok(EdgeRegistry { executors })
    }
}
