use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::BlockId;

/// Block content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Structured,
    Switch,
    Weblink,
}

/// A typed data cell. Content is written only by edges that list the block among their outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Informational; the key in the graph's block map is authoritative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<BlockId>,
    #[serde(rename = "type")]
    pub kind: BlockKind,
    #[serde(default)]
    pub data: BlockData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockData {
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_view: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub looped: Option<bool>,
    #[serde(default, rename = "isInput", skip_serializing_if = "Option::is_none")]
    pub is_input: Option<bool>,
    /// Unknown fields, kept so a block round-trips unchanged.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Block {
    pub fn new(kind: BlockKind, content: Value) -> Self {
        Self {
            id: None,
            kind,
            data: BlockData {
                content,
                ..BlockData::default()
            },
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(BlockKind::Text, Value::String(content.into()))
    }

    pub fn structured(content: Value) -> Self {
        Self::new(BlockKind::Structured, content)
    }

    /// An unfilled block of the given kind, waiting for a producing edge.
    pub fn empty(kind: BlockKind) -> Self {
        Self::new(kind, Value::Null)
    }

    pub fn with_embedding_view(mut self, view: Value) -> Self {
        self.data.embedding_view = Some(view);
        self
    }

    pub fn content(&self) -> &Value {
        &self.data.content
    }

    /// The embedding view, or the content when the block has none.
    pub fn view_or_content(&self) -> &Value {
        match &self.data.embedding_view {
            Some(view) if !view.is_null() => view,
            _ => &self.data.content,
        }
    }

    pub fn is_filled(&self) -> bool {
        is_filled(&self.data.content)
    }
}

/// True unless the value is null, an empty string, an empty list or an empty map.
pub fn is_filled(content: &Value) -> bool {
    match content {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}
