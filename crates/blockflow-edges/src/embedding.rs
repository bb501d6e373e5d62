//! Embedding edge: embed each chunk of the source block's embedding view.

use std::sync::Arc;

use blockflow_core::executor::{EdgeExecutor, EdgeOutput, EdgeRegistryBuilder};
use blockflow_core::{EdgeError, EdgeKind, ResolvedEdge};
use serde_json::{Value, json};

use crate::support::{ProviderError, texts_of};

/// Embedding provider. Returns one vector per input text, in order.
pub trait EmbeddingModel: Send + Sync {
    fn embed(&self, model: Option<&str>, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

pub struct EmbeddingExecutor {
    model: Arc<dyn EmbeddingModel>,
}

impl EmbeddingExecutor {
    pub fn new(model: Arc<dyn EmbeddingModel>) -> Self {
        Self { model }
    }
}

impl EdgeExecutor for EmbeddingExecutor {
    fn kind(&self) -> EdgeKind {
        EdgeKind::Embedding
    }

    fn execute(&self, edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError> {
        let texts = texts_of(edge.content().unwrap_or(&Value::Null));
        if texts.is_empty() {
            return Ok(EdgeOutput::Content(Value::Array(Vec::new())));
        }
        let vectors = self.model.embed(edge.field_str("model"), &texts)?;
        if vectors.len() != texts.len() {
            return Err(EdgeError::provider(format!(
                "embedding provider returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        let entries = texts
            .into_iter()
            .zip(vectors)
            .map(|(content, embedding)| json!({ "content": content, "embedding": embedding }))
            .collect();
        Ok(EdgeOutput::Content(Value::Array(entries)))
    }
}

pub fn register_embedding(
    builder: EdgeRegistryBuilder,
    model: Arc<dyn EmbeddingModel>,
) -> EdgeRegistryBuilder {
    builder.register(Arc::new(EmbeddingExecutor::new(model)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::testing::resolve;
    use blockflow_core::{Block, Edge};

    struct Lengths;

    impl EmbeddingModel for Lengths {
        fn embed(&self, _: Option<&str>, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }
    }

    struct Short;

    impl EmbeddingModel for Short {
        fn embed(&self, _: Option<&str>, _: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(vec![])
        }
    }

    fn edge() -> Edge {
        Edge::new(EdgeKind::Embedding).input("chunks").output("index")
    }

    #[test]
    fn pairs_each_chunk_with_its_vector() {
        let chunks = Block::text("raw").with_embedding_view(json!(["ab", "cde"]));
        let out = EmbeddingExecutor::new(Arc::new(Lengths))
            .execute(&resolve(edge(), &[("chunks", chunks)]))
            .unwrap();
        assert_eq!(
            out,
            EdgeOutput::Content(json!([
                { "content": "ab", "embedding": [2.0] },
                { "content": "cde", "embedding": [3.0] }
            ]))
        );
    }

    #[test]
    fn vector_count_mismatch_is_a_provider_error() {
        let chunks = Block::structured(json!(["x"]));
        let err = EmbeddingExecutor::new(Arc::new(Short))
            .execute(&resolve(edge(), &[("chunks", chunks)]))
            .unwrap_err();
        assert!(matches!(err, EdgeError::Provider(_)));
    }
}
