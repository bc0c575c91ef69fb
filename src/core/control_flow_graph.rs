//! Control-flow graph over basic blocks.
//!
//! Derived after the worklist drains: every xref with both ends resolved
//! contributes one edge between the blocks owning its source and target.
//! Blocks that simply run into the next block get an implicit fall-through
//! edge.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::core::basic_block::BlockId;
use crate::core::xref::XRefType;

/// Edge kind in the control-flow graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ControlFlowEdgeKind {
    /// Block runs into the next one
    Fallthrough,
    /// Conditional branch, taken or not
    Branch,
    Jump,
    /// Jump through a table slot
    IndexedJump,
    /// Call; procedure membership does not follow these
    Call,
}

impl ControlFlowEdgeKind {
    pub fn value(&self) -> &str {
        match self {
            ControlFlowEdgeKind::Fallthrough => "fallthrough",
            ControlFlowEdgeKind::Branch => "branch",
            ControlFlowEdgeKind::Jump => "jump",
            ControlFlowEdgeKind::IndexedJump => "indexed",
            ControlFlowEdgeKind::Call => "call",
        }
    }

    /// Edge kind for an xref type; seeded entries have no edge.
    pub fn from_xref(kind: XRefType) -> Option<Self> {
        match kind {
            XRefType::UserSpecified => None,
            XRefType::ConditionalJump => Some(ControlFlowEdgeKind::Branch),
            XRefType::NearJump | XRefType::FarJump => Some(ControlFlowEdgeKind::Jump),
            XRefType::NearIndexedJump => Some(ControlFlowEdgeKind::IndexedJump),
            XRefType::NearCall | XRefType::FarCall => Some(ControlFlowEdgeKind::Call),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControlFlowEdge {
    pub from: BlockId,
    pub to: BlockId,
    pub kind: ControlFlowEdgeKind,
}

/// Block-level control-flow graph of one session.
#[derive(Debug, Clone, Default)]
pub struct ControlFlowGraph {
    edges: BTreeSet<ControlFlowEdge>,
    outgoing: HashMap<BlockId, Vec<ControlFlowEdge>>,
    incoming: HashMap<BlockId, Vec<ControlFlowEdge>>,
}

impl ControlFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge; duplicates are ignored.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId, kind: ControlFlowEdgeKind) {
        let edge = ControlFlowEdge { from, to, kind };
        if self.edges.insert(edge) {
            self.outgoing.entry(from).or_default().push(edge);
            self.incoming.entry(to).or_default().push(edge);
        }
    }

    pub fn outgoing_edges(&self, block: BlockId) -> &[ControlFlowEdge] {
        self.outgoing.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming_edges(&self, block: BlockId) -> &[ControlFlowEdge] {
        self.incoming.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.outgoing_edges(block).iter().map(|e| e.to).collect()
    }

    pub fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        self.incoming_edges(block).iter().map(|e| e.from).collect()
    }

    pub fn edges(&self) -> impl Iterator<Item = &ControlFlowEdge> {
        self.edges.iter()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}
