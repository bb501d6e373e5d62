//! Edge executors: the per-kind handler trait, the registry and the dispatcher.

mod condition_edge;
mod dispatch;
mod registry;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::EdgeError;
use crate::model::{BlockId, EdgeKind};
use crate::parser::ResolvedEdge;

pub use condition_edge::ConditionExecutor;
pub use dispatch::{Dispatched, dispatch, expand_loop};
pub use registry::{EdgeRegistry, EdgeRegistryBuilder};

/// Result of one executor invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeOutput {
    /// Written to every declared output block.
    Content(Value),
    /// A distinct value per block; every key must be a declared output.
    Blocks(BTreeMap<BlockId, Value>),
}

/// Handler for one edge kind.
///
/// Executors are synchronous and run on the blocking worker pool, so they may block on I/O.
/// They must not touch engine state: everything they need is in the [`ResolvedEdge`].
pub trait EdgeExecutor: Send + Sync {
    fn kind(&self) -> EdgeKind;

    fn execute(&self, edge: &ResolvedEdge) -> Result<EdgeOutput, EdgeError>;
}
