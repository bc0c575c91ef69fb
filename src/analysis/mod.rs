//! Code discovery over an image.
//!
//! An analysis [`Session`] holds everything discovered about one image:
//! basic blocks, cross references, procedures, the control-flow graph and
//! diagnostics. [`analyze`] drains a worklist seeded from entry points and
//! then rebuilds the derived data. Sessions are independent values, so
//! several images can be analyzed one after another or on separate threads.

pub mod engine;
pub mod flow;
pub mod jump_table;
pub mod procedures;
pub mod worklist;

use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;
use crate::core::address::{Address, Location};
use crate::core::basic_block::{BasicBlock, BasicBlockStore, BlockId};
use crate::core::control_flow_graph::ControlFlowGraph;
use crate::core::diagnostic::ErrorCollection;
use crate::core::procedure::{Procedure, ProcedureStore};
use crate::core::segment::ByteAttribute;
use crate::core::xref::{XRef, XRefCollection, XRefType};
use crate::disasm::Decoder;
use crate::image::Image;

/// A caller-supplied place to start analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryPoint {
    pub address: Address,
    /// `UserSpecified` or `FarCall`
    pub kind: XRefType,
}

impl EntryPoint {
    pub fn user(address: Address) -> Self {
        Self {
            address,
            kind: XRefType::UserSpecified,
        }
    }

    /// Entry reached by far calls, such as an exported far procedure.
    pub fn far_call(address: Address) -> Self {
        Self {
            address,
            kind: XRefType::FarCall,
        }
    }
}

/// A jump-table slot read during analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSlot {
    /// The indexed jump instruction
    pub jump: Address,
    pub slot: Address,
    pub location: Location,
}

/// State of one analysis over one image.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub(crate) blocks: BasicBlockStore,
    pub(crate) xrefs: XRefCollection,
    pub(crate) procedures: ProcedureStore,
    pub(crate) cfg: ControlFlowGraph,
    pub(crate) errors: ErrorCollection,
    pub(crate) table_slots: Vec<TableSlot>,
    pub(crate) entries: Vec<EntryPoint>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter().map(|(_, block)| block)
    }

    pub fn block_store(&self) -> &BasicBlockStore {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id)
    }

    /// Block covering `address`.
    pub fn block_at(&self, image: &dyn Image, address: Address) -> Option<&BasicBlock> {
        let location = image.locate(address)?;
        self.blocks.get(self.blocks.containing(location)?)
    }

    pub fn procedures(&self) -> &ProcedureStore {
        &self.procedures
    }

    pub fn procedure_at(&self, image: &dyn Image, entry: Address) -> Option<&Procedure> {
        self.procedures.get(image.locate(entry)?)
    }

    pub fn xrefs(&self) -> &XRefCollection {
        &self.xrefs
    }

    pub fn xrefs_from(&self, source: Address) -> Vec<&XRef> {
        self.xrefs.from_address(source)
    }

    pub fn xrefs_to(&self, target: Address) -> Vec<&XRef> {
        self.xrefs.to_address(target)
    }

    pub fn cfg(&self) -> &ControlFlowGraph {
        &self.cfg
    }

    pub fn errors(&self) -> &ErrorCollection {
        &self.errors
    }

    pub fn table_slots(&self) -> &[TableSlot] {
        &self.table_slots
    }

    pub fn entries(&self) -> &[EntryPoint] {
        &self.entries
    }

    pub fn byte_attribute(&self, image: &dyn Image, address: Address) -> Option<ByteAttribute> {
        image.byte_attribute(address)
    }
}

/// Analyze `image` from `entries`, adding to what `session` already knows.
///
/// Drains the worklist to completion, then rebuilds the control-flow graph
/// and procedures. Never fails: problems end up in [`Session::errors`].
pub fn analyze(
    image: &mut dyn Image,
    decoder: &dyn Decoder,
    session: &mut Session,
    entries: &[EntryPoint],
    config: &AnalysisConfig,
) {
    let span = tracing::info_span!("analyze", entries = entries.len());
    let _guard = span.enter();
    tracing::info!(
        segments = image.segment_count(),
        decoder = decoder.name(),
        "starting analysis"
    );

    engine::Engine::new(image, decoder, session, config).run(entries);
    procedures::generate_procedures(image, session, config);

    tracing::info!(
        blocks = session.blocks.len(),
        xrefs = session.xrefs.len(),
        procedures = session.procedures.len(),
        edges = session.cfg.edge_count(),
        diagnostics = session.errors.len(),
        "analysis finished"
    );
}
