//! Edge input resolution.
//!
//! [`check_edge`] performs the static checks that need only the edge definition and is run at
//! submission. [`resolve_edge`] repeats them and then reads the current block contents into a
//! [`ResolvedEdge`], the per-invocation value handed to an executor.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::condition::{Case, parse_cases};
use crate::error::ConfigError;
use crate::model::{Block, BlockId, Edge, EdgeId, EdgeKind};
use crate::template::{PluginValue, Plugins, substitute_value};

/// Modify operations that take one source block rather than a template.
const SOURCE_MODIFY_TYPES: &[&str] = &["copy", "convert2text", "convert2structured", "deliver"];
const TEMPLATE_MODIFY_TYPES: &[&str] = &["edit_text", "edit_structured"];

/// Kind-specific input shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The edge's `content` field (a template, message list or list of items); executors render
    /// it against [`ResolvedEdge::plugins`].
    Template { content: Option<Value> },
    /// One source block's content (`modify` copy-like types) or embedding view (`chunk`,
    /// `rechunk`, `embedding`). `label` is the plugin key the content was read under.
    Source { label: String, content: Value },
    /// Query and documents (`search`, `rerank`).
    Search { query: Value, docs: Value },
    /// Independently resolved `content` and `switch` groups.
    Choose { content: Value, switch: Value },
    /// Every declared input's content plus the parsed cases.
    Condition {
        contents: BTreeMap<BlockId, Value>,
        cases: Vec<(String, Case)>,
    },
}

/// One executor invocation: the edge definition with its inputs materialised.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEdge {
    pub edge_id: EdgeId,
    pub kind: EdgeKind,
    pub looped: bool,
    pub plugins: Plugins,
    pub payload: Payload,
    pub extra_configs: Map<String, Value>,
    pub fields: Map<String, Value>,
    pub outputs: Vec<BlockId>,
    /// Position within a looped fan-out.
    pub iteration: Option<usize>,
}

impl ResolvedEdge {
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Content the executor should work on: source content, or the template content.
    pub fn content(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Source { content, .. } => Some(content),
            Payload::Template { content } => content.as_ref(),
            Payload::Choose { content, .. } => Some(content),
            Payload::Search { .. } | Payload::Condition { .. } => None,
        }
    }
}

/// Static checks on one edge definition.
pub fn check_edge(edge_id: &EdgeId, edge: &Edge) -> Result<(), ConfigError> {
    match edge.kind {
        EdgeKind::Modify => {
            let modify_type = modify_type(edge_id, edge)?;
            if SOURCE_MODIFY_TYPES.contains(&modify_type) {
                source_block(edge_id, edge)?;
            }
        }
        EdgeKind::Chunk | EdgeKind::Rechunk | EdgeKind::Embedding => {
            source_block(edge_id, edge)?;
        }
        EdgeKind::Search | EdgeKind::Rerank => {
            declared_input(edge_id, edge, "query_id")?;
            declared_input(edge_id, edge, "docs_id")?;
        }
        EdgeKind::Choose => {
            for field in ["content", "switch"] {
                let raw = edge.data.field(field).ok_or_else(|| ConfigError::MissingField {
                    edge_id: edge_id.clone(),
                    field: field.into(),
                })?;
                for id in group_ids(edge_id, field, raw)? {
                    require_input(edge_id, edge, &id)?;
                }
            }
            for field in ["ON", "OFF"] {
                if let Some(raw) = edge.data.field(field) {
                    for id in group_ids(edge_id, field, raw)? {
                        require_output(edge_id, edge, &id)?;
                    }
                }
            }
        }
        EdgeKind::Condition => {
            for (_, case) in condition_cases(edge_id, edge)? {
                for condition in &case.conditions {
                    require_input(edge_id, edge, &condition.block)?;
                }
                require_input(edge_id, edge, &case.then.from)?;
                require_output(edge_id, edge, &case.then.to)?;
            }
        }
        EdgeKind::Load
        | EdgeKind::Save
        | EdgeKind::Llm
        | EdgeKind::Rewrite
        | EdgeKind::Code => {}
    }
    Ok(())
}

/// Materialise an edge's inputs from the current block map.
pub fn resolve_edge(
    edge_id: &EdgeId,
    edge: &Edge,
    blocks: &BTreeMap<BlockId, Block>,
) -> Result<ResolvedEdge, ConfigError> {
    check_edge(edge_id, edge)?;

    let lookup = |block_id: &BlockId| {
        blocks.get(block_id).ok_or_else(|| ConfigError::UnknownBlock {
            edge_id: edge_id.clone(),
            block_id: block_id.clone(),
        })
    };

    let mut plugins = Plugins::new();
    for block_id in edge.data.inputs.keys() {
        let block = lookup(block_id)?;
        let value = PluginValue::from_content(block.content());
        let label = edge.data.label_for(block_id).unwrap_or(block_id.as_str());
        plugins
            .entry(block_id.clone())
            .or_insert_with(|| value.clone());
        plugins.insert(label.to_string(), value);
    }

    let source_modify = edge.kind == EdgeKind::Modify
        && SOURCE_MODIFY_TYPES.contains(&modify_type(edge_id, edge)?);
    let mut extra_configs = edge.data.extra_configs.clone();
    let payload = match edge.kind {
        EdgeKind::Modify if source_modify => {
            let source = source_block(edge_id, edge)?;
            extra_configs = match substitute_value(&Value::Object(extra_configs), &plugins) {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            Payload::Source {
                label: edge.data.label_for(source).unwrap_or(source.as_str()).to_string(),
                content: lookup(source)?.content().clone(),
            }
        }
        EdgeKind::Chunk | EdgeKind::Rechunk | EdgeKind::Embedding => {
            let source = source_block(edge_id, edge)?;
            Payload::Source {
                label: edge.data.label_for(source).unwrap_or(source.as_str()).to_string(),
                content: lookup(source)?.view_or_content().clone(),
            }
        }
        EdgeKind::Search | EdgeKind::Rerank => {
            let query = declared_input(edge_id, edge, "query_id")?;
            let docs = declared_input(edge_id, edge, "docs_id")?;
            Payload::Search {
                query: lookup(&query)?.content().clone(),
                docs: lookup(&docs)?.view_or_content().clone(),
            }
        }
        EdgeKind::Choose => {
            let group = |field: &str| -> Result<Value, ConfigError> {
                let raw = edge.data.field(field).cloned().unwrap_or(Value::Null);
                let values = group_ids(edge_id, field, &raw)?
                    .iter()
                    .map(|id| lookup(id).map(|b| b.content().clone()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(collapse(values))
            };
            let content = group("content")?;
            let switch = group("switch")?;
            Payload::Choose { content, switch }
        }
        EdgeKind::Condition => {
            let contents = edge
                .data
                .inputs
                .keys()
                .map(|id| lookup(id).map(|b| (id.clone(), b.content().clone())))
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            Payload::Condition {
                contents,
                cases: condition_cases(edge_id, edge)?,
            }
        }
        EdgeKind::Modify
        | EdgeKind::Load
        | EdgeKind::Save
        | EdgeKind::Llm
        | EdgeKind::Rewrite
        | EdgeKind::Code => Payload::Template {
            content: edge.data.field("content").cloned(),
        },
    };

    let mut fields = edge.data.fields.clone();
    fields.remove("plugins");

    Ok(ResolvedEdge {
        edge_id: edge_id.clone(),
        kind: edge.kind,
        looped: edge.data.looped,
        plugins,
        payload,
        extra_configs,
        fields,
        outputs: edge.data.outputs.keys().cloned().collect(),
        iteration: None,
    })
}

fn modify_type<'a>(edge_id: &EdgeId, edge: &'a Edge) -> Result<&'a str, ConfigError> {
    let modify_type = edge
        .data
        .field_str("modify_type")
        .ok_or_else(|| ConfigError::MissingField {
            edge_id: edge_id.clone(),
            field: "modify_type".into(),
        })?;
    if SOURCE_MODIFY_TYPES.contains(&modify_type) || TEMPLATE_MODIFY_TYPES.contains(&modify_type) {
        Ok(modify_type)
    } else {
        Err(ConfigError::InvalidField {
            edge_id: edge_id.clone(),
            field: "modify_type".into(),
            message: format!("unsupported modify type `{modify_type}`"),
        })
    }
}

/// `source_id` when given, otherwise the single declared input.
fn source_block<'a>(edge_id: &EdgeId, edge: &'a Edge) -> Result<&'a BlockId, ConfigError> {
    if let Some(source) = edge.data.field_str("source_id") {
        return edge
            .data
            .inputs
            .get_key_value(source)
            .map(|(id, _)| id)
            .ok_or_else(|| ConfigError::MissingInput {
                edge_id: edge_id.clone(),
                block_id: source.to_string(),
            });
    }
    let mut inputs = edge.data.inputs.keys();
    match (inputs.next(), inputs.next()) {
        (Some(only), None) => Ok(only),
        _ => Err(ConfigError::InvalidField {
            edge_id: edge_id.clone(),
            field: "inputs".into(),
            message: format!(
                "{} edge needs exactly one input block or a `source_id`",
                edge.kind
            ),
        }),
    }
}

fn declared_input(edge_id: &EdgeId, edge: &Edge, field: &str) -> Result<BlockId, ConfigError> {
    let id = edge
        .data
        .field_str(field)
        .ok_or_else(|| ConfigError::MissingField {
            edge_id: edge_id.clone(),
            field: field.into(),
        })?;
    require_input(edge_id, edge, id)?;
    Ok(id.to_string())
}

fn require_input(edge_id: &EdgeId, edge: &Edge, block_id: &str) -> Result<(), ConfigError> {
    if edge.data.inputs.contains_key(block_id) {
        Ok(())
    } else {
        Err(ConfigError::MissingInput {
            edge_id: edge_id.clone(),
            block_id: block_id.to_string(),
        })
    }
}

fn require_output(edge_id: &EdgeId, edge: &Edge, block_id: &str) -> Result<(), ConfigError> {
    if edge.data.outputs.contains_key(block_id) {
        Ok(())
    } else {
        Err(ConfigError::UndeclaredOutput {
            edge_id: edge_id.clone(),
            block_id: block_id.to_string(),
        })
    }
}

fn condition_cases(edge_id: &EdgeId, edge: &Edge) -> Result<Vec<(String, Case)>, ConfigError> {
    let raw = edge.data.field("cases").ok_or_else(|| ConfigError::MissingField {
        edge_id: edge_id.clone(),
        field: "cases".into(),
    })?;
    parse_cases(edge_id, raw)
}

/// Block ids of a group field: a single id, a list of ids, or a map keyed by id.
pub fn group_ids(edge_id: &EdgeId, field: &str, raw: &Value) -> Result<Vec<BlockId>, ConfigError> {
    let invalid = || ConfigError::InvalidField {
        edge_id: edge_id.clone(),
        field: field.into(),
        message: "expected a block id, a list of block ids or a map keyed by block id".into(),
    };
    match raw {
        Value::Null => Ok(Vec::new()),
        Value::String(id) => Ok(vec![id.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        Value::Object(map) => Ok(map.keys().cloned().collect()),
        _ => Err(invalid()),
    }
}

fn collapse(mut values: Vec<Value>) -> Value {
    match values.len() {
        0 => Value::Null,
        1 => values.remove(0),
        _ => Value::Array(values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Block;
    use serde_json::json;

    fn blocks(pairs: &[(&str, Block)]) -> BTreeMap<BlockId, Block> {
        pairs
            .iter()
            .map(|(id, b)| ((*id).to_string(), b.clone()))
            .collect()
    }

    fn id(s: &str) -> EdgeId {
        s.to_string()
    }

    #[test]
    fn plugins_are_keyed_by_label_and_block_id() {
        let edge = Edge::new(EdgeKind::Llm)
            .input_labeled("b1", "question")
            .input("b2")
            .output("b3")
            .with_field("content", json!("Answer {{question}} using {{b2}}"));
        let map = blocks(&[
            ("b1", Block::text("why?")),
            ("b2", Block::structured(json!(["doc"]))),
            ("b3", Block::text("")),
        ]);
        let resolved = resolve_edge(&id("e1"), &edge, &map).unwrap();
        assert_eq!(resolved.plugins["question"], PluginValue::Text("why?".into()));
        assert_eq!(resolved.plugins["b1"], PluginValue::Text("why?".into()));
        assert_eq!(resolved.plugins["b2"], PluginValue::Json(json!(["doc"])));
        assert_eq!(resolved.outputs, vec!["b3".to_string()]);
        assert!(matches!(resolved.payload, Payload::Template { content: Some(_) }));
    }

    #[test]
    fn copy_modify_reads_source_and_substitutes_extra_configs() {
        let edge = Edge::new(EdgeKind::Modify)
            .input_labeled("b1", "name")
            .output("b2")
            .with_field("modify_type", json!("copy"))
            .with_extra_config("title", json!("copy of {{name}}"));
        let map = blocks(&[("b1", Block::text("Ada")), ("b2", Block::text(""))]);
        let resolved = resolve_edge(&id("e1"), &edge, &map).unwrap();
        assert_eq!(
            resolved.payload,
            Payload::Source {
                label: "name".into(),
                content: json!("Ada")
            }
        );
        assert_eq!(resolved.extra_configs["title"], json!("copy of Ada"));
    }

    #[test]
    fn chunk_prefers_embedding_view() {
        let edge = Edge::new(EdgeKind::Chunk).input("docs").output("chunks");
        let map = blocks(&[
            (
                "docs",
                Block::structured(json!("raw")).with_embedding_view(json!(["d1", "d2"])),
            ),
            ("chunks", Block::structured(Value::Null)),
        ]);
        let resolved = resolve_edge(&id("e1"), &edge, &map).unwrap();
        assert_eq!(resolved.content(), Some(&json!(["d1", "d2"])));
    }

    #[test]
    fn search_requires_declared_query_and_docs() {
        let edge = Edge::new(EdgeKind::Search)
            .input("q")
            .output("out")
            .with_field("query_id", json!("q"))
            .with_field("docs_id", json!("corpus"));
        assert_eq!(
            check_edge(&id("e1"), &edge),
            Err(ConfigError::MissingInput {
                edge_id: id("e1"),
                block_id: "corpus".into()
            })
        );
        let edge = Edge::new(EdgeKind::Search).input("q").output("out");
        assert!(matches!(
            check_edge(&id("e1"), &edge),
            Err(ConfigError::MissingField { field, .. }) if field == "query_id"
        ));
    }

    #[test]
    fn choose_resolves_groups_independently() {
        let edge = Edge::new(EdgeKind::Choose)
            .input("c")
            .input("s")
            .output("on")
            .output("off")
            .with_field("content", json!(["c"]))
            .with_field("switch", json!({ "s": "flag" }))
            .with_field("ON", json!(["on"]))
            .with_field("OFF", json!(["off"]));
        let map = blocks(&[
            ("c", Block::text("payload")),
            ("s", Block::text("true")),
            ("on", Block::text("")),
            ("off", Block::text("")),
        ]);
        let resolved = resolve_edge(&id("e1"), &edge, &map).unwrap();
        assert_eq!(
            resolved.payload,
            Payload::Choose {
                content: json!("payload"),
                switch: json!("true")
            }
        );
    }

    #[test]
    fn condition_case_blocks_must_be_declared() {
        let cases = json!({
            "c1": {
                "conditions": [{ "block": "x", "condition": "is_empty", "parameters": {}, "operation": "/" }],
                "then": { "from": "a", "to": "b" }
            }
        });
        let edge = Edge::new(EdgeKind::Condition)
            .input("a")
            .output("b")
            .with_field("cases", cases.clone());
        assert!(matches!(
            check_edge(&id("e1"), &edge),
            Err(ConfigError::MissingInput { block_id, .. }) if block_id == "x"
        ));
        let edge = Edge::new(EdgeKind::Condition)
            .input("a")
            .input("x")
            .output("z")
            .with_field("cases", cases);
        assert!(matches!(
            check_edge(&id("e1"), &edge),
            Err(ConfigError::UndeclaredOutput { block_id, .. }) if block_id == "b"
        ));
    }

    #[test]
    fn bad_modify_type_and_ambiguous_source_are_rejected() {
        let edge = Edge::new(EdgeKind::Modify).with_field("modify_type", json!("shuffle"));
        assert!(matches!(
            check_edge(&id("e1"), &edge),
            Err(ConfigError::InvalidField { field, .. }) if field == "modify_type"
        ));
        let edge = Edge::new(EdgeKind::Modify)
            .input("a")
            .input("b")
            .with_field("modify_type", json!("copy"));
        assert!(matches!(
            check_edge(&id("e1"), &edge),
            Err(ConfigError::InvalidField { field, .. }) if field == "inputs"
        ));
    }
}
