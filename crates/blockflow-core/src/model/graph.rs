use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Block, BlockId, Edge, EdgeId};
use crate::error::ConfigError;

/// Graph schema versions this engine executes. A submission without a version is read as `0.1`.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.1"];

/// A submitted graph: the block map, the edge map and the schema version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub blocks: BTreeMap<BlockId, Block>,
    #[serde(default)]
    pub edges: BTreeMap<EdgeId, Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Graph {
    pub fn from_json(value: Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| ConfigError::MalformedGraph(e.to_string()))
    }

    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn check_version(&self) -> Result<(), ConfigError> {
        match self.version.as_deref() {
            None => Ok(()),
            Some(v) if SUPPORTED_VERSIONS.contains(&v) => Ok(()),
            Some(v) => Err(ConfigError::UnsupportedVersion(v.to_string())),
        }
    }

    /// Every block an edge reads or writes must exist in the block map.
    pub fn check_references(&self) -> Result<(), ConfigError> {
        for (edge_id, edge) in &self.edges {
            for block_id in edge.inputs().chain(edge.outputs()) {
                if !self.blocks.contains_key(block_id) {
                    return Err(ConfigError::UnknownBlock {
                        edge_id: edge_id.clone(),
                        block_id: block_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Fluent builder for [`Graph`], used by tests and embedding callers.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    blocks: BTreeMap<BlockId, Block>,
    edges: BTreeMap<EdgeId, Edge>,
    version: Option<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(mut self, id: impl Into<BlockId>, block: Block) -> Self {
        self.blocks.insert(id.into(), block);
        self
    }

    pub fn edge(mut self, id: impl Into<EdgeId>, edge: Edge) -> Self {
        self.edges.insert(id.into(), edge);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn build(self) -> Graph {
        Graph {
            blocks: self.blocks,
            edges: self.edges,
            version: self.version,
        }
    }
}
