//! Chunk edge: split a document into a list of text chunks.
//!
//! `chunking_mode` selects the splitter: `length` (default; `chunk_size` chars with `overlap`)
//! or `delimiter` (alias `character`; split on any of `delimiters`, default a newline). Sizes
//! and delimiters are read from `extra_configs`.

use blockflow_core::executor::{EdgeExecutor, EdgeOutput};
use blockflow_core::{EdgeError, EdgeKind, ResolvedEdge};
use serde_json::Value;
use tracing::debug;

use crate::support::{setting, setting_usize, texts_of};

const DEFAULT_CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkMode {
    Length { size: usize, overlap: usize },
    Delimiter { delimiters: Vec<String> },
}

impl ChunkMode {
    pub fn from_edge(edge: &ResolvedEdge) -> Result<Self, EdgeError> {
        match edge.field_str("chunking_mode").unwrap_or("length") {
            "length" => {
                let size = setting_usize(edge, "chunk_size")?.unwrap_or(DEFAULT_CHUNK_SIZE);
                let overlap = setting_usize(edge, "overlap")?.unwrap_or(0);
                if size == 0 || overlap >= size {
                    return Err(EdgeError::invalid_config(format!(
                        "chunk_size must be positive and larger than overlap (got {size}/{overlap})"
                    )));
                }
                Ok(ChunkMode::Length { size, overlap })
            }
            "delimiter" | "character" => {
                let delimiters = match setting(edge, "delimiters") {
                    None => vec!["\n".to_string()],
                    Some(Value::String(d)) => vec![d.clone()],
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|d| d.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| EdgeError::invalid_config("`delimiters` must be strings"))?,
                    Some(_) => {
                        return Err(EdgeError::invalid_config(
                            "`delimiters` must be a string or a list of strings",
                        ));
                    }
                };
                if delimiters.iter().any(String::is_empty) {
                    return Err(EdgeError::invalid_config("delimiters must not be empty"));
                }
                Ok(ChunkMode::Delimiter { delimiters })
            }
            other => Err(EdgeError::invalid_config(format!(
                "unsupported chunking_mode `{other}`"
            ))),
        }
    }

    /// Empty input yields no chunks.
    pub fn split(&self, text: &str) -> Vec<String> {
        match self {
            ChunkMode::Length { size, overlap } => {
                let chars: Vec<char> = text.chars().collect();
                let step = size - overlap;
                let mut chunks = Vec::new();
                let mut start = 0;
                while start < chars.len() {
                    let end = (start + size).min(chars.len());
                    chunks.push(chars[start..end].iter().collect());
                    if end == chars.len() {
                        break;
                    }
                    start += step;
                }
                chunks
            }
            ChunkMode::Delimiter { delimiters } => {
                let mut pieces = vec![text.to_string()];
                for delimiter in delimiters {
                    pieces = pieces
                        .iter()
                        .flat_map(|p| p.split(delimiter.as_str()))
                        .map(str::to_string)
                        .collect();
                }
                pieces
                    .into_iter()
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            }
        }
    }
}

pub struct ChunkExecutor;

impl EdgeExecutor for ChunkExecutor {
    fn kind(&self) -> EdgeKind {
        EdgeKind::Chunk
    }

    fn execute(&self, edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError> {
        let mode = ChunkMode::from_edge(edge)?;
        let document = edge
            .content()
            .ok_or_else(|| EdgeError::invalid_input("chunk edge has no source document"))?;
        let chunks: Vec<Value> = texts_of(document)
            .iter()
            .flat_map(|text| mode.split(text))
            .map(Value::String)
            .collect();
        debug!(edge_id = %edge.edge_id, chunks = chunks.len(), "chunked document");
        Ok(EdgeOutput::Content(Value::Array(chunks)))
    }
}
