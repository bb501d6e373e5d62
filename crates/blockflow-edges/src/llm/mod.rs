//! LLM and rewrite edges: render a message list and send it to an injected chat model.
//! Pass your model when registering: `register_llm(builder, Arc::new(your_model))`.

mod openai;

use std::sync::Arc;

use blockflow_core::executor::{EdgeExecutor, EdgeOutput, EdgeRegistryBuilder};
use blockflow_core::template::Template;
use blockflow_core::{EdgeError, EdgeKind, ResolvedEdge};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::support::{ProviderError, setting_bool, text_of};

pub use openai::OpenAiChat;

const REWRITE_INSTRUCTION: &str =
    "Rewrite the user's query so it is clear and self-contained for retrieval. Reply with the rewritten query only.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// The caller expects a JSON document back.
    pub structured_output: bool,
    /// Provider settings from `extra_configs` (temperature, max tokens, ...).
    pub settings: Map<String, Value>,
}

/// Chat completion provider.
pub trait ChatModel: Send + Sync {
    fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError>;
}

pub struct LlmExecutor {
    kind: EdgeKind,
    model: Arc<dyn ChatModel>,
}

impl LlmExecutor {
    pub fn llm(model: Arc<dyn ChatModel>) -> Self {
        Self {
            kind: EdgeKind::Llm,
            model,
        }
    }

    pub fn rewrite(model: Arc<dyn ChatModel>) -> Self {
        Self {
            kind: EdgeKind::Rewrite,
            model,
        }
    }

    fn request(&self, edge: &ResolvedEdge) -> Result<ChatRequest, EdgeError> {
        let source = edge
            .content()
            .or_else(|| edge.fields.get("messages"))
            .ok_or_else(|| EdgeError::invalid_config("llm edge needs `content` or `messages`"))?;
        let mut messages = render_messages(source, edge)?;
        if self.kind == EdgeKind::Rewrite {
            let instruction = edge.field_str("instruction").unwrap_or(REWRITE_INSTRUCTION);
            messages.insert(0, ChatMessage::new("system", instruction));
        }
        Ok(ChatRequest {
            model: edge.field_str("model").map(str::to_string),
            messages,
            structured_output: setting_bool(edge, "structured_output"),
            settings: edge.extra_configs.clone(),
        })
    }
}

fn render_messages(source: &Value, edge: &ResolvedEdge) -> Result<Vec<ChatMessage>, EdgeError> {
    let render = |text: &str| Template::compile(text).render(&edge.plugins);
    let message = |value: &Value| -> Result<ChatMessage, EdgeError> {
        match value {
            Value::String(text) => Ok(ChatMessage::new("user", render(text))),
            Value::Object(map) => {
                let role = map.get("role").and_then(Value::as_str).unwrap_or("user");
                let content = map
                    .get("content")
                    .ok_or_else(|| EdgeError::invalid_config("message without `content`"))?;
                Ok(ChatMessage::new(role, render(&text_of(content))))
            }
            other => Ok(ChatMessage::new("user", render(&text_of(other)))),
        }
    };
    match source {
        Value::Array(items) if items.is_empty() => Err(EdgeError::invalid_config("empty message list")),
        Value::Array(items) => items.iter().map(message).collect(),
        other => Ok(vec![message(other)?]),
    }
}

impl EdgeExecutor for LlmExecutor {
    fn kind(&self) -> EdgeKind {
        self.kind
    }

    fn execute(&self, edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError> {
        let request = self.request(edge)?;
        debug!(
            edge_id = %edge.edge_id,
            kind = %self.kind,
            messages = request.messages.len(),
            model = request.model.as_deref().unwrap_or("default"),
            iteration = ?edge.iteration,
            "chat request"
        );
        let reply = self.model.complete(&request)?;
        if request.structured_output {
            let value = serde_json::from_str(reply.trim()).map_err(|e| {
                EdgeError::provider(format!("model reply is not valid JSON: {e}"))
            })?;
            return Ok(EdgeOutput::Content(value));
        }
        Ok(EdgeOutput::Content(Value::String(reply)))
    }
}

pub fn register_llm(builder: EdgeRegistryBuilder, model: Arc<dyn ChatModel>) -> EdgeRegistryBuilder {
    builder.register(Arc::new(LlmExecutor::llm(model)))
}

pub fn register_rewrite(builder: EdgeRegistryBuilder, model: Arc<dyn ChatModel>) -> EdgeRegistryBuilder {
    builder.register(Arc::new(LlmExecutor::rewrite(model)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::testing::resolve;
    use blockflow_core::executor::{Dispatched, EdgeRegistry, dispatch};
    use blockflow_core::{Block, Edge};
    use serde_json::json;
    use std::sync::Mutex;

    /// Replies with the last message, and records every request.
    #[derive(Default)]
    struct Echo {
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl ChatModel for Echo {
        fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default())
        }
    }

    #[test]
    fn message_lists_are_rendered_per_message() {
        let echo = Arc::new(Echo::default());
        let edge = Edge::new(EdgeKind::Llm)
            .input_labeled("q", "question")
            .output("answer")
            .with_field("model", json!("small"))
            .with_field(
                "messages",
                json!([
                    { "role": "system", "content": "Be brief." },
                    { "role": "user", "content": "Q: {{question}}" }
                ]),
            );
        let resolved = resolve(edge, &[("q", Block::text("why?"))]);
        let out = LlmExecutor::llm(echo.clone()).execute(&resolved).unwrap();
        assert_eq!(out, EdgeOutput::Content(json!("Q: why?")));
        let seen = echo.seen.lock().unwrap();
        assert_eq!(seen[0].model.as_deref(), Some("small"));
        assert_eq!(seen[0].messages[0], ChatMessage::new("system", "Be brief."));
    }

    #[test]
    fn structured_output_is_parsed() {
        let edge = Edge::new(EdgeKind::Llm)
            .input("q")
            .output("a")
            .with_field("content", json!("{\"n\": {{q}}}"))
            .with_field("structured_output", json!(true));
        let resolved = resolve(edge, &[("q", Block::structured(json!(3)))]);
        let out = LlmExecutor::llm(Arc::new(Echo::default())).execute(&resolved).unwrap();
        assert_eq!(out, EdgeOutput::Content(json!({ "n": 3 })));
    }

    #[test]
    fn rewrite_prepends_instruction() {
        let echo = Arc::new(Echo::default());
        let edge = Edge::new(EdgeKind::Rewrite)
            .input("q")
            .output("a")
            .with_field("content", json!("{{q}}"));
        let resolved = resolve(edge, &[("q", Block::text("rust async?"))]);
        LlmExecutor::rewrite(echo.clone()).execute(&resolved).unwrap();
        let seen = echo.seen.lock().unwrap();
        assert_eq!(seen[0].messages[0].role, "system");
        assert_eq!(seen[0].messages[1].content, "rust async?");
    }

    #[test]
    fn looped_llm_keeps_iterations_independent() {
        let echo = Arc::new(Echo::default());
        let registry = register_llm(EdgeRegistry::builder(), echo.clone()).build().unwrap();
        let edge = Edge::new(EdgeKind::Llm)
            .input("city")
            .input("country")
            .input("style")
            .output("out")
            .looped(true)
            .with_field("content", json!("{{style}}: {{city}}, {{country}}"));
        let resolved = resolve(
            edge,
            &[
                ("city", Block::structured(json!(["Paris", "Rome", "Oslo"]))),
                ("country", Block::structured(json!(["FR", "IT", "NO"]))),
                ("style", Block::text("short")),
            ],
        );
        let out = dispatch(&resolved, &registry).unwrap();
        assert_eq!(
            out,
            Dispatched::Looped(vec![
                EdgeOutput::Content(json!("short: Paris, FR")),
                EdgeOutput::Content(json!("short: Rome, IT")),
                EdgeOutput::Content(json!("short: Oslo, NO")),
            ])
        );
        assert_eq!(echo.seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn provider_failure_is_a_provider_error() {
        struct Down;
        impl ChatModel for Down {
            fn complete(&self, _: &ChatRequest) -> Result<String, ProviderError> {
                Err(ProviderError::new("503"))
            }
        }
        let edge = Edge::new(EdgeKind::Llm)
            .input("q")
            .output("a")
            .with_field("content", json!("{{q}}"));
        let resolved = resolve(edge, &[("q", Block::text("x"))]);
        let err = LlmExecutor::llm(Arc::new(Down)).execute(&resolved).unwrap_err();
        assert_eq!(err, EdgeError::Provider("503".into()));
    }
}
