//! Core data types for Scatha.
//!
//! The analysis model: addresses and symbolic targets, segments with their
//! byte attributes and fixups, decoded instructions, basic blocks, cross
//! references, procedures, the control-flow graph and diagnostics.

pub mod address;
pub mod basic_block;
pub mod control_flow_graph;
pub mod diagnostic;
pub mod fixup;
pub mod instruction;
pub mod procedure;
pub mod segment;
pub mod xref;
