//! Control-flow graph and procedure derivation.
//!
//! Runs after the worklist drains and rebuilds everything from the blocks
//! and xrefs currently in the session, so repeated analysis passes always
//! see a consistent picture.

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use crate::analysis::engine::split_block;
use crate::analysis::Session;
use crate::config::AnalysisConfig;
use crate::core::address::{Address, Location};
use crate::core::basic_block::{BlockId, BlockTermination};
use crate::core::control_flow_graph::{ControlFlowEdgeKind, ControlFlowGraph};
use crate::core::diagnostic::{Diagnostic, ErrorCode, Severity};
use crate::core::procedure::{CallType, Procedure, ProcedureStore};
use crate::core::segment::ByteKind;
use crate::core::xref::XRefType;
use crate::image::Image;

/// Rebuild the session's control-flow graph and procedures.
pub fn generate_procedures(image: &mut dyn Image, session: &mut Session, config: &AnalysisConfig) {
    let symbols = code_symbols(image);
    for (&location, (address, _)) in &symbols {
        if split_block(image, &mut session.blocks, *address, location) {
            debug!(address = %address, "split block at symbol");
        }
    }

    session.cfg = build_cfg(image, session);
    session.errors.remove_code(ErrorCode::InconsistentCall);

    let mut procedures = ProcedureStore::new();
    let calls: Vec<(Address, CallType)> = session
        .xrefs
        .iter()
        .filter(|x| x.kind.is_call())
        .filter_map(|x| Some((x.target?, call_type(x.kind))))
        .collect();
    for (target, call_type) in calls {
        add_procedure(image, session, &mut procedures, target, call_type, true);
    }
    let entries: Vec<(Address, CallType)> = session
        .entries
        .iter()
        .map(|e| (e.address, call_type(e.kind)))
        .collect();
    for (address, call_type) in entries {
        add_procedure(image, session, &mut procedures, address, call_type, false);
    }
    for (address, _) in symbols.values() {
        add_procedure(image, session, &mut procedures, *address, CallType::Near, false);
    }

    assign_blocks(session, &mut procedures);
    attach_table_slots(image, session, &mut procedures);
    if config.name_procedures {
        for (location, (_, name)) in &symbols {
            if let Some(procedure) = procedures.get_mut(*location) {
                procedure.name = Some(name.clone());
            }
        }
    }
    session.procedures = procedures;
}

fn call_type(kind: XRefType) -> CallType {
    match kind {
        XRefType::FarCall => CallType::Far,
        _ => CallType::Near,
    }
}

/// Symbols sitting on instruction boundaries, first name per location.
fn code_symbols(image: &dyn Image) -> BTreeMap<Location, (Address, String)> {
    let mut out = BTreeMap::new();
    for (address, name) in image.symbols() {
        let Some(location) = image.locate(address) else {
            continue;
        };
        let on_boundary = image
            .segment(location.segment)
            .and_then(|segment| segment.attribute(location.index))
            .is_some_and(|attr| attr.kind() == ByteKind::Code && attr.is_lead_byte());
        if on_boundary {
            out.entry(location).or_insert((address, name));
        }
    }
    out
}

fn owner(image: &dyn Image, address: Address) -> Option<BlockId> {
    image.byte_attribute(address)?.block()
}

fn build_cfg(image: &dyn Image, session: &Session) -> ControlFlowGraph {
    let mut cfg = ControlFlowGraph::new();
    for xref in session.xrefs.iter() {
        let (Some(source), Some(target)) = (xref.source, xref.target) else {
            continue;
        };
        let Some(mut kind) = ControlFlowEdgeKind::from_xref(xref.kind) else {
            continue;
        };
        let (Some(from), Some(to)) = (owner(image, source), owner(image, target)) else {
            debug!(xref = %xref, "xref endpoint has no block");
            continue;
        };
        let not_taken = session
            .blocks
            .get(from)
            .and_then(|block| block.end())
            .is_some_and(|end| end == target);
        if xref.kind == XRefType::ConditionalJump && not_taken {
            kind = ControlFlowEdgeKind::Fallthrough;
        }
        cfg.add_edge(from, to, kind);
    }
    for (id, block) in session.blocks.iter() {
        if block.termination != BlockTermination::FallThrough {
            continue;
        }
        match block.end().and_then(|end| owner(image, end)) {
            Some(next) => cfg.add_edge(id, next, ControlFlowEdgeKind::Fallthrough),
            None => debug!(block = %block, "fall-through target has no block"),
        }
    }
    cfg
}

fn add_procedure(
    image: &dyn Image,
    session: &mut Session,
    procedures: &mut ProcedureStore,
    entry: Address,
    call_type: CallType,
    check_call_type: bool,
) {
    let Some(location) = image.locate(entry) else {
        return;
    };
    if session.blocks.starting_at(location).is_none() {
        debug!(entry = %entry, "procedure entry is not a block start");
        return;
    }
    if let Some(existing) = procedures.get(location) {
        if check_call_type && existing.call_type != call_type {
            let diagnostic = Diagnostic::new(
                Some(entry),
                Severity::Warning,
                ErrorCode::InconsistentCall,
                "Procedure {0} is called both near and far",
                vec![image.format_address(entry)],
            );
            session.errors.push(diagnostic);
        }
        return;
    }
    procedures.insert(Procedure::new(entry, location, call_type));
}

/// Attach to each procedure the blocks reachable from its entry without
/// following calls or entering another procedure.
fn assign_blocks(session: &Session, procedures: &mut ProcedureStore) {
    let entries = procedures.entries();
    for procedure in procedures.iter_mut() {
        let Some(root) = session.blocks.starting_at(procedure.entry_location) else {
            continue;
        };
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if !procedure.blocks.insert(id) {
                continue;
            }
            for edge in session.cfg.outgoing_edges(id) {
                if edge.kind == ControlFlowEdgeKind::Call {
                    continue;
                }
                let Some(block) = session.blocks.get(edge.to) else {
                    continue;
                };
                if block.location != procedure.entry_location && entries.contains(&block.location) {
                    continue;
                }
                queue.push_back(edge.to);
            }
        }
    }
}

fn attach_table_slots(image: &dyn Image, session: &Session, procedures: &mut ProcedureStore) {
    for slot in &session.table_slots {
        let Some(jump_block) = owner(image, slot.jump) else {
            continue;
        };
        let range = slot.location.index..slot.location.index + 2;
        for procedure in procedures.iter_mut() {
            if procedure.blocks.contains(&jump_block) {
                procedure.add_data(slot.location.segment, range.clone());
            }
        }
    }
}
