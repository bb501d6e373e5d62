use blockflow_core::{EdgeError, ResolvedEdge};
use serde_json::Value;

/// Failure reported by an injected provider (model, vector store, sandbox, filesystem).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ProviderError(pub String);

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<ProviderError> for EdgeError {
    fn from(err: ProviderError) -> Self {
        EdgeError::Provider(err.0)
    }
}

/// Text form of a block content: strings verbatim, everything else as compact JSON.
pub(crate) fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Texts of a document list. Items may be strings or objects with a `content` field.
pub(crate) fn texts_of(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().map(item_text).collect(),
        other => vec![item_text(other)],
    }
}

fn item_text(item: &Value) -> String {
    match item.get("content") {
        Some(content) => text_of(content),
        None => text_of(item),
    }
}

/// A setting read from `extra_configs` first, then from the edge's own fields.
pub(crate) fn setting<'a>(edge: &'a ResolvedEdge, key: &str) -> Option<&'a Value> {
    edge.extra_configs
        .get(key)
        .or_else(|| edge.fields.get(key))
        .filter(|v| !v.is_null())
}

pub(crate) fn setting_usize(edge: &ResolvedEdge, key: &str) -> Result<Option<usize>, EdgeError> {
    match setting(edge, key) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .map(|n| Some(n as usize))
            .ok_or_else(|| EdgeError::invalid_config(format!("`{key}` must be a non-negative integer"))),
    }
}

pub(crate) fn setting_bool(edge: &ResolvedEdge, key: &str) -> bool {
    setting(edge, key).is_some_and(|v| v.as_bool().unwrap_or(false))
}
