use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use super::{EdgeOutput, EdgeRegistry};
use crate::error::{ConfigError, EngineError, Stage};
use crate::model::{BlockId, EdgeKind};
use crate::parser::{Payload, ResolvedEdge};
use crate::template::PluginValue;

/// Output of one dispatched edge: a single invocation or a looped fan-out in input order.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Single(EdgeOutput),
    Looped(Vec<EdgeOutput>),
}

impl Dispatched {
    /// Per-block writes. Looped runs produce one list per output block.
    pub fn into_writes(self, edge: &ResolvedEdge) -> Result<BTreeMap<BlockId, Value>, ConfigError> {
        let check = |writes: &BTreeMap<BlockId, Value>| {
            match writes.keys().find(|id| !edge.outputs.contains(id)) {
                Some(id) => Err(ConfigError::UndeclaredOutput {
                    edge_id: edge.edge_id.clone(),
                    block_id: id.clone(),
                }),
                None => Ok(()),
            }
        };
        match self {
            Dispatched::Single(EdgeOutput::Content(value)) => Ok(edge
                .outputs
                .iter()
                .map(|id| (id.clone(), value.clone()))
                .collect()),
            Dispatched::Single(EdgeOutput::Blocks(writes)) => {
                check(&writes)?;
                Ok(writes)
            }
            Dispatched::Looped(items) => {
                for item in &items {
                    if let EdgeOutput::Blocks(writes) = item {
                        check(writes)?;
                    }
                }
                Ok(edge
                    .outputs
                    .iter()
                    .map(|id| {
                        let list = items
                            .iter()
                            .map(|item| match item {
                                EdgeOutput::Content(value) => value.clone(),
                                EdgeOutput::Blocks(writes) => {
                                    writes.get(id).cloned().unwrap_or(Value::Null)
                                }
                            })
                            .collect();
                        (id.clone(), Value::Array(list))
                    })
                    .collect())
            }
        }
    }
}

/// Split a looped edge into its per-iteration invocations.
///
/// Returns `None` when the edge runs once: it is not looped, or its kind ignores the flag.
pub fn expand_loop(edge: &ResolvedEdge) -> Result<Option<Vec<ResolvedEdge>>, ConfigError> {
    if !edge.looped {
        return Ok(None);
    }
    let invalid = |message: String| ConfigError::InvalidLoop {
        edge_id: edge.edge_id.clone(),
        message,
    };
    match edge.kind {
        EdgeKind::Chunk => {
            let Some(Value::Array(docs)) = edge.content() else {
                return Err(invalid("looped chunk edge needs a list of documents".into()));
            };
            Ok(Some(
                docs.iter()
                    .enumerate()
                    .map(|(i, doc)| with_content(edge, i, doc.clone()))
                    .collect(),
            ))
        }
        EdgeKind::Llm | EdgeKind::Code | EdgeKind::Modify => {
            let lists: BTreeMap<&String, &Vec<Value>> = edge
                .plugins
                .iter()
                .filter_map(|(k, v)| v.as_list().map(|list| (k, list)))
                .collect();
            if let Some(len) = lists.values().next().map(|l| l.len()) {
                if let Some((key, other)) = lists.iter().find(|(_, l)| l.len() != len) {
                    return Err(invalid(format!(
                        "plugin `{key}` has {} items, expected {len}",
                        other.len()
                    )));
                }
                let invocations = (0..len)
                    .map(|i| {
                        let mut item = edge.clone();
                        item.iteration = Some(i);
                        for (key, list) in &lists {
                            item.plugins
                                .insert((*key).clone(), PluginValue::from_content(&list[i]));
                        }
                        if let Payload::Source { label, content } = &mut item.payload
                            && let Some(value) = item.plugins.get(label.as_str())
                        {
                            *content = value.to_value();
                        }
                        item
                    })
                    .collect();
                return Ok(Some(invocations));
            }
            match edge.content() {
                Some(Value::Array(items)) => Ok(Some(
                    items
                        .iter()
                        .enumerate()
                        .map(|(i, value)| with_content(edge, i, value.clone()))
                        .collect(),
                )),
                _ => Err(invalid(
                    "looped edge needs list-valued plugins or a list content".into(),
                )),
            }
        }
        _ => Ok(None),
    }
}

fn with_content(edge: &ResolvedEdge, index: usize, value: Value) -> ResolvedEdge {
    let mut item = edge.clone();
    item.iteration = Some(index);
    match &mut item.payload {
        Payload::Source { content, .. } => *content = value,
        Payload::Template { content } => *content = Some(value),
        _ => {}
    }
    item
}

/// Route a resolved edge to its executor, fanning out when looped.
pub fn dispatch(edge: &ResolvedEdge, registry: &EdgeRegistry) -> Result<Dispatched, EngineError> {
    let executor = registry
        .get(edge.kind)
        .ok_or_else(|| EngineError::config(Stage::Dispatch, ConfigError::UnregisteredKind(edge.kind)))?;
    let run = |invocation: &ResolvedEdge| {
        executor
            .execute(invocation)
            .map_err(|e| EngineError::edge(edge.edge_id.clone(), edge.kind, e))
    };
    match expand_loop(edge).map_err(|e| EngineError::config(Stage::Dispatch, e))? {
        None => run(edge).map(Dispatched::Single),
        Some(invocations) => {
            debug!(edge_id = %edge.edge_id, iterations = invocations.len(), "looped dispatch");
            invocations
                .iter()
                .map(run)
                .collect::<Result<Vec<_>, _>>()
                .map(Dispatched::Looped)
        }
    }
}
