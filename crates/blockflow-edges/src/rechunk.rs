//! Rechunk edge: join an existing chunk list and split it again with a new chunking mode.

use blockflow_core::executor::{EdgeExecutor, EdgeOutput};
use blockflow_core::{EdgeError, EdgeKind, ResolvedEdge};
use serde_json::Value;

use crate::chunk::ChunkMode;
use crate::support::{setting, texts_of};

pub struct RechunkExecutor;

impl EdgeExecutor for RechunkExecutor {
    fn kind(&self) -> EdgeKind {
        EdgeKind::Rechunk
    }

    fn execute(&self, edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError> {
        let mode = ChunkMode::from_edge(edge)?;
        let chunks = edge
            .content()
            .ok_or_else(|| EdgeError::invalid_input("rechunk edge has no source chunks"))?;
        let separator = setting(edge, "separator")
            .and_then(Value::as_str)
            .unwrap_or("\n");
        let joined = texts_of(chunks).join(separator);
        Ok(EdgeOutput::Content(Value::Array(
            mode.split(&joined).into_iter().map(Value::String).collect(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::testing::resolve;
    use blockflow_core::{Block, Edge};
    use serde_json::json;

    #[test]
    fn rechunk_merges_small_chunks() {
        let edge = Edge::new(EdgeKind::Rechunk)
            .input("chunks")
            .output("out")
            .with_extra_config("chunk_size", json!(5))
            .with_extra_config("separator", json!(" "));
        let chunks = Block::structured(json!(["ab", { "content": "cd" }, "efgh"]));
        let out = RechunkExecutor.execute(&resolve(edge, &[("chunks", chunks)])).unwrap();
        assert_eq!(out, EdgeOutput::Content(json!(["ab cd", " efgh"])));
    }
}
