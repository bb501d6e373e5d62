//! Execution state of one graph and the readiness helpers the scheduler runs over it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Block, BlockId, Edge, EdgeId, EdgeKind, Graph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Pending,
    Processed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    Pending,
    Completed,
}

/// Blocks and edges of a task together with their execution state.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphState {
    pub blocks: BTreeMap<BlockId, Block>,
    pub edges: BTreeMap<EdgeId, Edge>,
    pub block_states: BTreeMap<BlockId, BlockState>,
    pub edge_states: BTreeMap<EdgeId, EdgeState>,
}

impl GraphState {
    /// Filled blocks start processed, all others pending; every edge starts pending.
    pub fn new(graph: Graph) -> Self {
        let block_states = graph
            .blocks
            .iter()
            .map(|(id, block)| {
                let state = if block.is_filled() {
                    BlockState::Processed
                } else {
                    BlockState::Pending
                };
                (id.clone(), state)
            })
            .collect();
        let edge_states = graph
            .edges
            .keys()
            .map(|id| (id.clone(), EdgeState::Pending))
            .collect();
        Self {
            blocks: graph.blocks,
            edges: graph.edges,
            block_states,
            edge_states,
        }
    }

    pub fn is_processed(&self, block_id: &str) -> bool {
        self.block_states.get(block_id) == Some(&BlockState::Processed)
    }

    pub fn processed_count(&self) -> usize {
        self.block_states
            .values()
            .filter(|s| **s == BlockState::Processed)
            .count()
    }

    /// Share of processed blocks, 0..=100. An empty graph counts as complete.
    pub fn progress_percentage(&self) -> f64 {
        if self.blocks.is_empty() {
            return 100.0;
        }
        self.processed_count() as f64 * 100.0 / self.blocks.len() as f64
    }

    /// Write `writes` into the block map, mark those blocks processed and `edge_id` completed.
    pub fn apply(&mut self, edge_id: &str, writes: &BTreeMap<BlockId, Value>) {
        for (block_id, value) in writes {
            if let Some(block) = self.blocks.get_mut(block_id) {
                block.data.content = value.clone();
                self.block_states
                    .insert(block_id.clone(), BlockState::Processed);
            }
        }
        if let Some(state) = self.edge_states.get_mut(edge_id) {
            *state = EdgeState::Completed;
        }
    }

    /// Re-arm every completed edge downstream of `target` and reset their outputs (except `target`)
    /// to pending. Returns the re-armed edge ids.
    pub fn rearm_downstream(&mut self, target: &str) -> Vec<EdgeId> {
        let downstream = downstream_edges(self, target);
        let mut rearmed = Vec::new();
        for edge_id in downstream {
            if self.edge_states.get(&edge_id) != Some(&EdgeState::Completed) {
                continue;
            }
            self.edge_states.insert(edge_id.clone(), EdgeState::Pending);
            if let Some(edge) = self.edges.get(&edge_id) {
                for output in edge.outputs() {
                    if output != target {
                        self.block_states
                            .insert(output.clone(), BlockState::Pending);
                    }
                }
            }
            rearmed.push(edge_id);
        }
        rearmed
    }
}

/// Edges that read `block_id`.
pub fn consumers<'a>(state: &'a GraphState, block_id: &'a str) -> impl Iterator<Item = &'a EdgeId> {
    state
        .edges
        .iter()
        .filter(move |(_, edge)| edge.data.inputs.contains_key(block_id))
        .map(|(id, _)| id)
}

/// Edges reachable from `block_id` by following inputs to outputs, breadth first.
pub fn downstream_edges(state: &GraphState, block_id: &str) -> Vec<EdgeId> {
    let mut seen_blocks: BTreeSet<BlockId> = BTreeSet::from([block_id.to_string()]);
    let mut seen_edges: BTreeSet<EdgeId> = BTreeSet::new();
    let mut order = Vec::new();
    let mut queue: VecDeque<BlockId> = VecDeque::from([block_id.to_string()]);
    while let Some(current) = queue.pop_front() {
        for edge_id in consumers(state, &current) {
            if !seen_edges.insert(edge_id.clone()) {
                continue;
            }
            order.push(edge_id.clone());
            if let Some(edge) = state.edges.get(edge_id) {
                for output in edge.outputs() {
                    if seen_blocks.insert(output.clone()) {
                        queue.push_back(output.clone());
                    }
                }
            }
        }
    }
    order
}

/// Pending edges whose inputs are all processed. When any condition edge is ready, only the
/// ready condition edges are returned.
pub fn ready_edges(state: &GraphState) -> Vec<EdgeId> {
    let ready: Vec<(&EdgeId, &Edge)> = state
        .edges
        .iter()
        .filter(|(id, _)| state.edge_states.get(*id) == Some(&EdgeState::Pending))
        .filter(|(_, edge)| edge.inputs().all(|b| state.is_processed(b)))
        .collect();
    let conditions: Vec<EdgeId> = ready
        .iter()
        .filter(|(_, edge)| edge.kind == EdgeKind::Condition)
        .map(|(id, _)| (*id).clone())
        .collect();
    if conditions.is_empty() {
        ready.into_iter().map(|(id, _)| id.clone()).collect()
    } else {
        conditions
    }
}
