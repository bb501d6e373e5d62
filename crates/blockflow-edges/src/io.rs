//! Load and save edges: bring external content into the graph and write block content out.
//! The filesystem implementations [`FsLoader`] and [`FsSink`] cover the `file` type; other
//! source types (URLs, buckets, databases) are supplied by the embedding application.

use std::path::Path;
use std::sync::Arc;

use blockflow_core::executor::{EdgeExecutor, EdgeOutput, EdgeRegistryBuilder};
use blockflow_core::template::{Template, substitute_value};
use blockflow_core::{EdgeError, EdgeKind, ResolvedEdge};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::support::{ProviderError, setting_bool, text_of};

#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub source_type: String,
    pub location: String,
    /// Parse the loaded text as JSON.
    pub structured: bool,
}

pub trait Loader: Send + Sync {
    fn load(&self, request: &LoadRequest) -> Result<Value, ProviderError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest {
    pub target_type: String,
    pub location: String,
    pub content: Value,
}

pub trait Sink: Send + Sync {
    /// Returns a receipt describing what was written.
    fn save(&self, request: &SaveRequest) -> Result<Value, ProviderError>;
}

/// Location from a `source`/`target` field or the string `content`, with placeholders filled.
fn location(edge: &ResolvedEdge, field: &str) -> Result<String, EdgeError> {
    let raw = edge
        .field_str(field)
        .or_else(|| edge.content().and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            EdgeError::invalid_config(format!("{} edge needs `{field}` or a string `content`", edge.kind))
        })?;
    Ok(Template::compile(raw).render(&edge.plugins))
}

pub struct LoadExecutor {
    loader: Arc<dyn Loader>,
}

impl LoadExecutor {
    pub fn new(loader: Arc<dyn Loader>) -> Self {
        Self { loader }
    }
}

impl EdgeExecutor for LoadExecutor {
    fn kind(&self) -> EdgeKind {
        EdgeKind::Load
    }

    fn execute(&self, edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError> {
        let request = LoadRequest {
            source_type: edge.field_str("source_type").unwrap_or("file").to_string(),
            location: location(edge, "source")?,
            structured: setting_bool(edge, "structured"),
        };
        Ok(EdgeOutput::Content(self.loader.load(&request)?))
    }
}

/// Saves the `body` template when given. Otherwise one distinct input content is saved as is and
/// several are saved as an object keyed by plugin name.
pub struct SaveExecutor {
    sink: Arc<dyn Sink>,
}

impl SaveExecutor {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink }
    }
}

impl EdgeExecutor for SaveExecutor {
    fn kind(&self) -> EdgeKind {
        EdgeKind::Save
    }

    fn execute(&self, edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError> {
        let content = match edge.fields.get("body") {
            Some(template) => substitute_value(template, &edge.plugins),
            None => inputs_value(edge),
        };
        let request = SaveRequest {
            target_type: edge.field_str("target_type").unwrap_or("file").to_string(),
            location: location(edge, "target")?,
            content,
        };
        let receipt = self.sink.save(&request)?;
        info!(edge_id = %edge.edge_id, target_type = %request.target_type, location = %request.location, "content saved");
        Ok(EdgeOutput::Content(receipt))
    }
}

/// Plugins carry each input under both its label and its block id, so one input shows up as
/// one distinct value under several names.
fn inputs_value(edge: &ResolvedEdge) -> Value {
    let by_name: Map<String, Value> = edge
        .plugins
        .iter()
        .map(|(name, value)| (name.clone(), value.to_value()))
        .collect();
    let mut distinct: Vec<&Value> = Vec::new();
    for value in by_name.values() {
        if !distinct.contains(&value) {
            distinct.push(value);
        }
    }
    match distinct.as_slice() {
        [] => Value::Null,
        [only] => (*only).clone(),
        _ => Value::Object(by_name),
    }
}

pub struct FsLoader;

impl Loader for FsLoader {
    fn load(&self, request: &LoadRequest) -> Result<Value, ProviderError> {
        if request.source_type != "file" {
            return Err(ProviderError(format!(
                "unsupported source type: {}",
                request.source_type
            )));
        }
        let path = Path::new(&request.location);
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProviderError(format!("{}: not found", path.display()))
            } else {
                ProviderError(format!("{}: {e}", path.display()))
            }
        })?;
        if request.structured {
            return serde_json::from_str(&text)
                .map_err(|e| ProviderError(format!("{}: invalid JSON: {e}", path.display())));
        }
        Ok(Value::String(text))
    }
}

pub struct FsSink;

impl Sink for FsSink {
    fn save(&self, request: &SaveRequest) -> Result<Value, ProviderError> {
        if request.target_type != "file" {
            return Err(ProviderError(format!(
                "unsupported target type: {}",
                request.target_type
            )));
        }
        let path = Path::new(&request.location);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProviderError(format!("{}: {e}", parent.display())))?;
        }
        let text = match &request.content {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| text_of(other)),
        };
        std::fs::write(path, &text).map_err(|e| ProviderError(format!("{}: {e}", path.display())))?;
        Ok(json!({ "saved": request.location, "bytes": text.len() }))
    }
}

pub fn register_load(builder: EdgeRegistryBuilder, loader: Arc<dyn Loader>) -> EdgeRegistryBuilder {
    builder.register(Arc::new(LoadExecutor::new(loader)))
}

pub fn register_save(builder: EdgeRegistryBuilder, sink: Arc<dyn Sink>) -> EdgeRegistryBuilder {
    builder.register(Arc::new(SaveExecutor::new(sink)))
}
