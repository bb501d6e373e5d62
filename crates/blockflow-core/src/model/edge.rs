use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::BlockId;

/// Edge kind. The wire value `ifelse` is accepted for [`EdgeKind::Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Load,
    Save,
    Modify,
    Llm,
    Chunk,
    Rechunk,
    Embedding,
    Search,
    Rerank,
    Rewrite,
    Code,
    Choose,
    #[serde(alias = "ifelse")]
    Condition,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 13] = [
        EdgeKind::Load,
        EdgeKind::Save,
        EdgeKind::Modify,
        EdgeKind::Llm,
        EdgeKind::Chunk,
        EdgeKind::Rechunk,
        EdgeKind::Embedding,
        EdgeKind::Search,
        EdgeKind::Rerank,
        EdgeKind::Rewrite,
        EdgeKind::Code,
        EdgeKind::Choose,
        EdgeKind::Condition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Load => "load",
            EdgeKind::Save => "save",
            EdgeKind::Modify => "modify",
            EdgeKind::Llm => "llm",
            EdgeKind::Chunk => "chunk",
            EdgeKind::Rechunk => "rechunk",
            EdgeKind::Embedding => "embedding",
            EdgeKind::Search => "search",
            EdgeKind::Rerank => "rerank",
            EdgeKind::Rewrite => "rewrite",
            EdgeKind::Code => "code",
            EdgeKind::Choose => "choose",
            EdgeKind::Condition => "condition",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A processing step reading its `inputs` blocks and writing its `outputs` blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: EdgeKind,
    #[serde(default)]
    pub data: EdgeData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeData {
    /// Block id to placeholder label. A list of ids is accepted and means "label = id".
    #[serde(default, deserialize_with = "deserialize_id_map")]
    pub inputs: BTreeMap<BlockId, String>,
    #[serde(default, deserialize_with = "deserialize_id_map")]
    pub outputs: BTreeMap<BlockId, String>,
    #[serde(default)]
    pub extra_configs: Map<String, Value>,
    #[serde(default)]
    pub looped: bool,
    /// Type-specific fields (`modify_type`, `content`, `messages`, `cases`, `switch`, ...).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EdgeData {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// Placeholder label of a declared input; empty labels fall back to the block id.
    pub fn label_for<'a>(&'a self, block_id: &'a str) -> Option<&'a str> {
        self.inputs.get(block_id).map(|label| {
            if label.trim().is_empty() {
                block_id
            } else {
                label.as_str()
            }
        })
    }
}

impl Edge {
    pub fn new(kind: EdgeKind) -> Self {
        Self {
            id: None,
            kind,
            data: EdgeData::default(),
        }
    }

    pub fn input(self, block_id: impl Into<BlockId>) -> Self {
        self.input_labeled(block_id, "")
    }

    pub fn input_labeled(mut self, block_id: impl Into<BlockId>, label: impl Into<String>) -> Self {
        self.data.inputs.insert(block_id.into(), label.into());
        self
    }

    pub fn output(mut self, block_id: impl Into<BlockId>) -> Self {
        self.data.outputs.insert(block_id.into(), String::new());
        self
    }

    pub fn looped(mut self, looped: bool) -> Self {
        self.data.looped = looped;
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.data.fields.insert(name.into(), value);
        self
    }

    pub fn with_extra_config(mut self, name: impl Into<String>, value: Value) -> Self {
        self.data.extra_configs.insert(name.into(), value);
        self
    }

    pub fn inputs(&self) -> impl Iterator<Item = &BlockId> {
        self.data.inputs.keys()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &BlockId> {
        self.data.outputs.keys()
    }
}

fn deserialize_id_map<'de, D>(deserializer: D) -> Result<BTreeMap<BlockId, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Map(BTreeMap<BlockId, Option<String>>),
        List(Vec<BlockId>),
        Null(()),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Map(map) => map
            .into_iter()
            .map(|(id, label)| (id, label.unwrap_or_default()))
            .collect(),
        Repr::List(ids) => ids.into_iter().map(|id| (id, String::new())).collect(),
        Repr::Null(()) => BTreeMap::new(),
    })
}
