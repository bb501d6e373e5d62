//! Choose edge: route the `content` group to the `ON` or `OFF` outputs depending on `switch`.
//!
//! Outputs of the branch not taken are left untouched, so edges reading them stay waiting.

use std::collections::BTreeMap;

use blockflow_core::executor::{EdgeExecutor, EdgeOutput};
use blockflow_core::parser::{Payload, group_ids};
use blockflow_core::{EdgeError, EdgeKind, ResolvedEdge};
use serde_json::Value;
use tracing::debug;

pub struct ChooseExecutor;

impl EdgeExecutor for ChooseExecutor {
    fn kind(&self) -> EdgeKind {
        EdgeKind::Choose
    }

    fn execute(&self, edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError> {
        let Payload::Choose { content, switch } = &edge.payload else {
            return Err(EdgeError::invalid_input("choose edge was not resolved as a choice"));
        };
        let branch = if is_on(switch) { "ON" } else { "OFF" };
        let targets = group_ids(&edge.edge_id, branch, edge.fields.get(branch).unwrap_or(&Value::Null))
            .map_err(|e| EdgeError::invalid_config(e.to_string()))?;
        debug!(edge_id = %edge.edge_id, branch, targets = targets.len(), "choose branch");
        let writes: BTreeMap<_, _> = targets
            .into_iter()
            .map(|id| (id, content.clone()))
            .collect();
        Ok(EdgeOutput::Blocks(writes))
    }
}

/// Switch truthiness. Strings `false`, `off`, `no` and `0` count as off.
fn is_on(switch: &Value) -> bool {
    match switch {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "" | "false" | "off" | "no" | "0"
        ),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::testing::resolve;
    use blockflow_core::{Block, Edge};
    use serde_json::json;

    fn choose() -> Edge {
        Edge::new(EdgeKind::Choose)
            .input("text")
            .input("flag")
            .output("yes")
            .output("no")
            .with_field("content", json!(["text"]))
            .with_field("switch", json!("flag"))
            .with_field("ON", json!(["yes"]))
            .with_field("OFF", json!({ "no": "" }))
    }

    fn run(flag: Block) -> EdgeOutput {
        let resolved = resolve(choose(), &[("text", Block::text("payload")), ("flag", flag)]);
        ChooseExecutor.execute(&resolved).unwrap()
    }

    #[test]
    fn switch_selects_branch() {
        assert_eq!(
            run(Block::structured(json!(true))),
            EdgeOutput::Blocks(BTreeMap::from([("yes".to_string(), json!("payload"))]))
        );
        assert_eq!(
            run(Block::text("off")),
            EdgeOutput::Blocks(BTreeMap::from([("no".to_string(), json!("payload"))]))
        );
    }

    #[test]
    fn truthiness() {
        assert!(is_on(&json!(1)));
        assert!(!is_on(&json!(0.0)));
        assert!(is_on(&json!("ON")));
        assert!(!is_on(&json!(" No ")));
        assert!(!is_on(&json!([])));
    }
}
