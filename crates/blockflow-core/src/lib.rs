pub mod condition;
pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod observability;
pub mod parser;
pub mod runtime;
pub mod store;
pub mod supervisor;
pub mod template;

// User-facing API: Graph, Block, Edge, EdgeExecutor, EdgeRegistry, Supervisor, EngineError.
pub use config::EngineConfig;
pub use error::{ConfigError, EdgeError, EngineError, ResourceError, Stage};
pub use executor::{EdgeExecutor, EdgeOutput, EdgeRegistry};
pub use model::{Block, BlockId, BlockKind, Edge, EdgeId, EdgeKind, Graph, TaskId};
pub use observability::init_observability;
pub use parser::ResolvedEdge;
pub use store::TaskStatus;
pub use supervisor::{StreamEvent, Supervisor, TaskStatusSnapshot, TaskStream, UserInfo};
