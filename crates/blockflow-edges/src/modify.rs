//! Modify edge: template edits and content conversions that need no provider.
//!
//! `edit_text` and `edit_structured` render the edge's `content` template against the plugins.
//! `copy`, `convert2text`, `convert2structured` and `deliver` work on a single source block.

use blockflow_core::executor::{EdgeExecutor, EdgeOutput};
use blockflow_core::template::{Template, substitute_value};
use blockflow_core::{EdgeError, EdgeKind, ResolvedEdge};
use serde_json::{Value, json};

use crate::support::{setting, text_of};

pub struct ModifyExecutor;

impl EdgeExecutor for ModifyExecutor {
    fn kind(&self) -> EdgeKind {
        EdgeKind::Modify
    }

    fn execute(&self, edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError> {
        let modify_type = edge
            .field_str("modify_type")
            .ok_or_else(|| EdgeError::invalid_config("modify_type is required"))?;
        let value = match modify_type {
            "edit_text" => edit_text(edge)?,
            "edit_structured" => edit_structured(edge)?,
            "copy" => source(edge)?.clone(),
            "convert2text" => Value::String(text_of(source(edge)?)),
            "convert2structured" => convert2structured(source(edge)?)?,
            "deliver" => json!({
                "content": source(edge)?,
                "configs": edge.extra_configs,
            }),
            other => {
                return Err(EdgeError::invalid_config(format!(
                    "unsupported modify type `{other}`"
                )));
            }
        };
        Ok(EdgeOutput::Content(value))
    }
}

fn source(edge: &ResolvedEdge) -> Result<&Value, EdgeError> {
    edge.content()
        .ok_or_else(|| EdgeError::invalid_input("modify edge has no source content"))
}

fn edit_text(edge: &ResolvedEdge) -> Result<Value, EdgeError> {
    let rendered = match edge.content() {
        Some(Value::String(text)) => Template::compile(text).render(&edge.plugins),
        Some(other) => text_of(&substitute_value(other, &edge.plugins)),
        None => return Err(EdgeError::invalid_config("edit_text needs a `content` template")),
    };
    Ok(Value::String(slice_chars(&rendered, setting(edge, "slice"))?))
}

/// `slice: [start, end]` keeps a char range; negative bounds count from the end.
fn slice_chars(text: &str, slice: Option<&Value>) -> Result<String, EdgeError> {
    let Some(slice) = slice else {
        return Ok(text.to_string());
    };
    let bounds = slice
        .as_array()
        .filter(|b| b.len() == 2)
        .and_then(|b| Some((b[0].as_i64()?, b[1].as_i64()?)))
        .ok_or_else(|| EdgeError::invalid_config("`slice` must be [start, end]"))?;
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len() as i64;
    let clamp = |i: i64| (if i < 0 { (len + i).max(0) } else { i.min(len) }) as usize;
    let (start, end) = (clamp(bounds.0), clamp(bounds.1));
    if start >= end {
        return Ok(String::new());
    }
    Ok(chars[start..end].iter().collect())
}

fn edit_structured(edge: &ResolvedEdge) -> Result<Value, EdgeError> {
    let template = edge
        .content()
        .ok_or_else(|| EdgeError::invalid_config("edit_structured needs a `content` template"))?;
    let mut value = match substitute_value(template, &edge.plugins) {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    };
    if let Some(path) = setting(edge, "path") {
        value = select(value, path)?;
    }
    Ok(value)
}

/// Follow `path` (keys and list indices) into `value`.
fn select(value: Value, path: &Value) -> Result<Value, EdgeError> {
    let steps = path
        .as_array()
        .ok_or_else(|| EdgeError::invalid_config("`path` must be a list of keys or indices"))?;
    let mut current = value;
    for step in steps {
        let next = match (step, &mut current) {
            (Value::String(key), Value::Object(map)) => map.remove(key),
            (Value::Number(n), Value::Array(items)) => n
                .as_u64()
                .map(|i| i as usize)
                .filter(|i| *i < items.len())
                .map(|i| items.swap_remove(i)),
            _ => None,
        };
        current = next.ok_or_else(|| EdgeError::invalid_input(format!("path step {step} not found")))?;
    }
    Ok(current)
}

fn convert2structured(content: &Value) -> Result<Value, EdgeError> {
    match content {
        Value::String(text) => serde_json::from_str(text)
            .map_err(|e| EdgeError::invalid_input(format!("content is not valid JSON: {e}"))),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::testing::resolve;
    use blockflow_core::executor::dispatch;
    use blockflow_core::executor::{Dispatched, EdgeRegistry};
    use blockflow_core::{Block, Edge};
    use std::sync::Arc;

    fn modify(modify_type: &str) -> Edge {
        Edge::new(EdgeKind::Modify)
            .with_field("modify_type", json!(modify_type))
            .output("out")
    }

    fn run(edge: Edge, blocks: &[(&str, Block)]) -> Result<EdgeOutput, EdgeError> {
        ModifyExecutor.execute(&resolve(edge, blocks))
    }

    #[test]
    fn edit_text_renders_labels_and_slices() {
        let edge = modify("edit_text")
            .input_labeled("b1", "name")
            .with_field("content", json!("Hello, {{name}}! {{missing}}"));
        let out = run(edge.clone(), &[("b1", Block::text("Ada"))]).unwrap();
        assert_eq!(out, EdgeOutput::Content(json!("Hello, Ada! {{missing}}")));

        let sliced = edge.with_extra_config("slice", json!([0, -13]));
        let out = run(sliced, &[("b1", Block::text("Ada"))]).unwrap();
        assert_eq!(out, EdgeOutput::Content(json!("Hello, Ada")));
    }

    #[test]
    fn edit_structured_parses_and_selects() {
        let edge = modify("edit_structured")
            .input("doc")
            .with_field("content", json!("{{doc}}"))
            .with_extra_config("path", json!(["items", 1]));
        let out = run(
            edge,
            &[("doc", Block::structured(json!({ "items": ["a", "b"] })))],
        )
        .unwrap();
        assert_eq!(out, EdgeOutput::Content(json!("b")));
    }

    #[test]
    fn conversions_work_on_the_source_block() {
        let structured = Block::structured(json!({ "k": 1 }));
        let out = run(modify("convert2text").input("src"), &[("src", structured.clone())]).unwrap();
        assert_eq!(out, EdgeOutput::Content(json!("{\"k\":1}")));

        let out = run(
            modify("convert2structured").input("src"),
            &[("src", Block::text("[1, 2]"))],
        )
        .unwrap();
        assert_eq!(out, EdgeOutput::Content(json!([1, 2])));

        let err = run(
            modify("convert2structured").input("src"),
            &[("src", Block::text("not json"))],
        )
        .unwrap_err();
        assert!(matches!(err, EdgeError::InvalidInput(_)));

        let out = run(modify("copy").input("src"), &[("src", structured)]).unwrap();
        assert_eq!(out, EdgeOutput::Content(json!({ "k": 1 })));
    }

    #[test]
    fn deliver_substitutes_extra_configs() {
        let edge = modify("deliver")
            .input_labeled("src", "body")
            .with_extra_config("subject", json!("About {{body}}"));
        let out = run(edge, &[("src", Block::text("rust"))]).unwrap();
        assert_eq!(
            out,
            EdgeOutput::Content(json!({ "content": "rust", "configs": { "subject": "About rust" } }))
        );
    }

    #[test]
    fn looped_edit_text_runs_once_per_list_item() {
        let registry = EdgeRegistry::builder()
            .register(Arc::new(ModifyExecutor))
            .build()
            .unwrap();
        let edge = modify("edit_text")
            .input("names")
            .input("greetings")
            .looped(true)
            .with_field("content", json!("{{greetings}} {{names}}"));
        let resolved = resolve(
            edge,
            &[
                ("names", Block::structured(json!(["Ada", "Linus", "Grace"]))),
                ("greetings", Block::structured(json!(["Hi", "Hey", "Yo"]))),
            ],
        );
        let out = dispatch(&resolved, &registry).unwrap();
        assert_eq!(
            out,
            Dispatched::Looped(vec![
                EdgeOutput::Content(json!("Hi Ada")),
                EdgeOutput::Content(json!("Hey Linus")),
                EdgeOutput::Content(json!("Yo Grace")),
            ])
        );
    }
}
