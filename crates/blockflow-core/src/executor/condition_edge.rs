use std::collections::BTreeMap;

use serde_json::Value;

use super::{EdgeExecutor, EdgeOutput};
use crate::error::EdgeError;
use crate::model::EdgeKind;
use crate::parser::{Payload, ResolvedEdge};

/// Evaluates every case in declaration order and applies each satisfied redirect.
/// When several satisfied cases target the same block the later case wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionExecutor;

impl EdgeExecutor for ConditionExecutor {
    fn kind(&self) -> EdgeKind {
        EdgeKind::Condition
    }

    fn execute(&self, edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError> {
        let Payload::Condition { contents, cases } = &edge.payload else {
            return Err(EdgeError::invalid_input("condition edge without resolved cases"));
        };
        let mut writes = BTreeMap::new();
        for (name, case) in cases {
            let redirect = case
                .evaluate(contents)
                .map_err(|e| EdgeError::invalid_config(format!("case {name}: {e}")))?;
            if let Some(redirect) = redirect {
                let value = contents.get(&redirect.from).cloned().unwrap_or(Value::Null);
                tracing::debug!(edge_id = %edge.edge_id, case = %name, to = %redirect.to, "condition case satisfied");
                writes.insert(redirect.to.clone(), value);
            }
        }
        Ok(EdgeOutput::Blocks(writes))
    }
}
