//! Code edge: run user code in an injected sandbox with the input blocks as variables.

use std::sync::Arc;

use blockflow_core::executor::{EdgeExecutor, EdgeOutput, EdgeRegistryBuilder};
use blockflow_core::{EdgeError, EdgeKind, ResolvedEdge};
use serde_json::{Map, Value};

use crate::support::ProviderError;

/// Sandboxed interpreter. `variables` maps each input label to its content.
pub trait CodeRunner: Send + Sync {
    fn run(&self, language: &str, code: &str, variables: &Map<String, Value>) -> Result<Value, ProviderError>;
}

pub struct CodeExecutor {
    runner: Arc<dyn CodeRunner>,
}

impl CodeExecutor {
    pub fn new(runner: Arc<dyn CodeRunner>) -> Self {
        Self { runner }
    }
}

impl EdgeExecutor for CodeExecutor {
    fn kind(&self) -> EdgeKind {
        EdgeKind::Code
    }

    fn execute(&self, edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError> {
        let code = edge
            .field_str("code")
            .or_else(|| edge.content().and_then(Value::as_str))
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| EdgeError::invalid_config("code edge needs `code` or a string `content`"))?;
        let variables: Map<String, Value> = edge
            .plugins
            .iter()
            .map(|(name, value)| (name.clone(), value.to_value()))
            .collect();
        let language = edge.field_str("language").unwrap_or("python");
        Ok(EdgeOutput::Content(self.runner.run(language, code, &variables)?))
    }
}

pub fn register_code(builder: EdgeRegistryBuilder, runner: Arc<dyn CodeRunner>) -> EdgeRegistryBuilder {
    builder.register(Arc::new(CodeExecutor::new(runner)))
}
