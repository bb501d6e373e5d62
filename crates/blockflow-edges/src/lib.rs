//! Built-in edge executors. Use with [`default_registry`] or [`registry_with`].
//!
//! `modify`, `chunk`, `rechunk` and `choose` need nothing external and are always registered.
//! The other kinds call out to a provider trait ([`ChatModel`], [`EmbeddingModel`],
//! [`SearchBackend`], [`Reranker`], [`CodeRunner`], [`Loader`], [`Sink`]) supplied by the caller.

mod choose;
mod chunk;
mod code;
mod embedding;
mod io;
mod llm;
mod modify;
mod rechunk;
mod search;
mod support;

use std::sync::Arc;

pub use choose::ChooseExecutor;
pub use chunk::{ChunkExecutor, ChunkMode};
pub use code::{CodeExecutor, CodeRunner, register_code};
pub use embedding::{EmbeddingExecutor, EmbeddingModel, register_embedding};
pub use io::{
    FsLoader, FsSink, LoadExecutor, LoadRequest, Loader, SaveExecutor, SaveRequest, Sink,
    register_load, register_save,
};
pub use llm::{
    ChatMessage, ChatModel, ChatRequest, LlmExecutor, OpenAiChat, register_llm, register_rewrite,
};
pub use modify::ModifyExecutor;
pub use rechunk::RechunkExecutor;
pub use search::{
    RerankExecutor, Reranker, SearchBackend, SearchExecutor, SearchRequest, register_rerank,
    register_search,
};
pub use support::ProviderError;

pub use blockflow_core::executor::{EdgeRegistry, EdgeRegistryBuilder};
pub use blockflow_core::{ConfigError, EdgeError, EdgeExecutor, EdgeKind};

/// Builder pre-loaded with the executors that need no provider.
pub fn default_builder() -> EdgeRegistryBuilder {
    EdgeRegistry::builder()
        .register(Arc::new(ModifyExecutor))
        .register(Arc::new(ChunkExecutor))
        .register(Arc::new(RechunkExecutor))
        .register(Arc::new(ChooseExecutor))
}

/// Registry with the provider-free executors plus `condition`.
pub fn default_registry() -> Result<EdgeRegistry, ConfigError> {
    default_builder().build()
}

/// Optional providers; each one present registers the edge kinds it serves.
#[derive(Default, Clone)]
pub struct Providers {
    /// Serves both `llm` and `rewrite`.
    pub chat: Option<Arc<dyn ChatModel>>,
    pub embedding: Option<Arc<dyn EmbeddingModel>>,
    pub search: Option<Arc<dyn SearchBackend>>,
    pub rerank: Option<Arc<dyn Reranker>>,
    pub code: Option<Arc<dyn CodeRunner>>,
    pub loader: Option<Arc<dyn Loader>>,
    pub sink: Option<Arc<dyn Sink>>,
}

impl Providers {
    /// Filesystem load/save only.
    pub fn filesystem() -> Self {
        Self {
            loader: Some(Arc::new(FsLoader)),
            sink: Some(Arc::new(FsSink)),
            ..Self::default()
        }
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatModel>) -> Self {
        self.chat = Some(chat);
        self
    }
}

/// Registry with the provider-free executors and one executor per supplied provider.
pub fn registry_with(providers: Providers) -> Result<EdgeRegistry, ConfigError> {
    let mut builder = default_builder();
    if let Some(chat) = providers.chat {
        builder = register_rewrite(register_llm(builder, chat.clone()), chat);
    }
    if let Some(model) = providers.embedding {
        builder = register_embedding(builder, model);
    }
    if let Some(backend) = providers.search {
        builder = register_search(builder, backend);
    }
    if let Some(reranker) = providers.rerank {
        builder = register_rerank(builder, reranker);
    }
    if let Some(runner) = providers.code {
        builder = register_code(builder, runner);
    }
    if let Some(loader) = providers.loader {
        builder = register_load(builder, loader);
    }
    if let Some(sink) = providers.sink {
        builder = register_save(builder, sink);
    }
    builder.build()
}
