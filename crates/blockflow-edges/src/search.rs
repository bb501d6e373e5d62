//! Search and rerank edges. Both read a query block and a documents block (`query_id`, `docs_id`).

use std::cmp::Ordering;
use std::sync::Arc;

use blockflow_core::executor::{EdgeExecutor, EdgeOutput, EdgeRegistryBuilder};
use blockflow_core::parser::Payload;
use blockflow_core::{EdgeError, EdgeKind, ResolvedEdge};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::support::{ProviderError, setting, setting_usize, text_of, texts_of};

const DEFAULT_TOP_K: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    /// `vector`, `web`, `keyword`, ... as named by the edge's `search_type`.
    pub search_type: String,
    pub query: String,
    /// The documents block's embedding view: an index, a collection handle or a list.
    pub documents: Value,
    pub top_k: usize,
    pub threshold: Option<f64>,
    pub settings: Map<String, Value>,
}

/// Retrieval backend (vector store, web search, keyword index).
pub trait SearchBackend: Send + Sync {
    fn search(&self, request: &SearchRequest) -> Result<Vec<Value>, ProviderError>;
}

/// Relevance scorer: one score per document, higher is better.
pub trait Reranker: Send + Sync {
    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f64>, ProviderError>;
}

fn query_and_docs(edge: &ResolvedEdge) -> Result<(&Value, &Value), EdgeError> {
    match &edge.payload {
        Payload::Search { query, docs } => Ok((query, docs)),
        _ => Err(EdgeError::invalid_input(format!(
            "{} edge was not resolved with a query and documents",
            edge.kind
        ))),
    }
}

pub struct SearchExecutor {
    backend: Arc<dyn SearchBackend>,
}

impl SearchExecutor {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self { backend }
    }
}

impl EdgeExecutor for SearchExecutor {
    fn kind(&self) -> EdgeKind {
        EdgeKind::Search
    }

    fn execute(&self, edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError> {
        let (query, docs) = query_and_docs(edge)?;
        let request = SearchRequest {
            search_type: edge.field_str("search_type").unwrap_or("vector").to_string(),
            query: text_of(query),
            documents: docs.clone(),
            top_k: setting_usize(edge, "top_k")?.unwrap_or(DEFAULT_TOP_K),
            threshold: setting(edge, "threshold").and_then(Value::as_f64),
            settings: edge.extra_configs.clone(),
        };
        let hits = self.backend.search(&request)?;
        debug!(edge_id = %edge.edge_id, search_type = %request.search_type, hits = hits.len(), "search finished");
        Ok(EdgeOutput::Content(Value::Array(
            hits.into_iter().take(request.top_k).collect(),
        )))
    }
}

pub struct RerankExecutor {
    reranker: Arc<dyn Reranker>,
}

impl RerankExecutor {
    pub fn new(reranker: Arc<dyn Reranker>) -> Self {
        Self { reranker }
    }
}

impl EdgeExecutor for RerankExecutor {
    fn kind(&self) -> EdgeKind {
        EdgeKind::Rerank
    }

    /// Documents ordered by descending score; ties keep their input order.
    fn execute(&self, edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError> {
        let (query, docs) = query_and_docs(edge)?;
        let documents = texts_of(docs);
        let scores = self.reranker.score(&text_of(query), &documents)?;
        if scores.len() != documents.len() {
            return Err(EdgeError::provider(format!(
                "reranker returned {} scores for {} documents",
                scores.len(),
                documents.len()
            )));
        }
        let mut ranked: Vec<(String, f64)> = documents.into_iter().zip(scores).collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        let top_k = setting_usize(edge, "top_k")?.unwrap_or(ranked.len());
        Ok(EdgeOutput::Content(Value::Array(
            ranked
                .into_iter()
                .take(top_k)
                .map(|(content, score)| json!({ "content": content, "score": score }))
                .collect(),
        )))
    }
}

pub fn register_search(
    builder: EdgeRegistryBuilder,
    backend: Arc<dyn SearchBackend>,
) -> EdgeRegistryBuilder {
    builder.register(Arc::new(SearchExecutor::new(backend)))
}

pub fn register_rerank(builder: EdgeRegistryBuilder, reranker: Arc<dyn Reranker>) -> EdgeRegistryBuilder {
    builder.register(Arc::new(RerankExecutor::new(reranker)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::testing::resolve;
    use blockflow_core::{Block, Edge};
    use std::sync::Mutex;

    /// Returns documents containing the query, and records requests.
    #[derive(Default)]
    struct Contains {
        seen: Mutex<Vec<SearchRequest>>,
    }

    impl SearchBackend for Contains {
        fn search(&self, request: &SearchRequest) -> Result<Vec<Value>, ProviderError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(texts_of(&request.documents)
                .into_iter()
                .filter(|d| d.contains(&request.query))
                .map(Value::String)
                .collect())
        }
    }

    /// Scores by shared characters with the query.
    struct Overlap;

    impl Reranker for Overlap {
        fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f64>, ProviderError> {
            Ok(documents
                .iter()
                .map(|d| d.chars().filter(|c| query.contains(*c)).count() as f64)
                .collect())
        }
    }

    fn edge(kind: EdgeKind) -> Edge {
        Edge::new(kind)
            .input("q")
            .input("docs")
            .output("hits")
            .with_field("query_id", json!("q"))
            .with_field("docs_id", json!("docs"))
    }

    fn blocks() -> Vec<(&'static str, Block)> {
        vec![
            ("q", Block::text("ab")),
            (
                "docs",
                Block::text("raw").with_embedding_view(json!(["xab", "b", "ab ab", "zz"])),
            ),
        ]
    }

    #[test]
    fn search_uses_view_and_top_k() {
        let backend = Arc::new(Contains::default());
        let edge = edge(EdgeKind::Search)
            .with_field("search_type", json!("keyword"))
            .with_extra_config("top_k", json!(1));
        let out = SearchExecutor::new(backend.clone())
            .execute(&resolve(edge, &blocks()))
            .unwrap();
        assert_eq!(out, EdgeOutput::Content(json!(["xab"])));
        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen[0].search_type, "keyword");
        assert_eq!(seen[0].query, "ab");
    }

    #[test]
    fn rerank_orders_by_score_keeping_ties_stable() {
        let out = RerankExecutor::new(Arc::new(Overlap))
            .execute(&resolve(edge(EdgeKind::Rerank).with_extra_config("top_k", json!(3)), &blocks()))
            .unwrap();
        assert_eq!(
            out,
            EdgeOutput::Content(json!([
                { "content": "ab ab", "score": 4.0 },
                { "content": "xab", "score": 2.0 },
                { "content": "b", "score": 1.0 }
            ]))
        );
    }
}
