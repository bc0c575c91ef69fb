//! Worklist-driven code discovery.
//!
//! Each popped cross reference either starts a new run of instructions,
//! splits an existing block, or reads one jump-table slot. A run decodes
//! forward until a terminator, a flow instruction, a conflict with bytes
//! already classified, or an error. Byte marking is monotonic, so every
//! byte is decoded at most once and the worklist always drains.

use thiserror::Error;
use tracing::{debug, trace};

use crate::analysis::flow::{self, FlowTarget};
use crate::analysis::jump_table;
use crate::analysis::worklist::Worklist;
use crate::analysis::{EntryPoint, Session, TableSlot};
use crate::config::AnalysisConfig;
use crate::core::address::{Address, Location, Referent};
use crate::core::basic_block::{BasicBlock, BasicBlockStore, BlockTermination};
use crate::core::diagnostic::{Diagnostic, ErrorCode, Severity};
use crate::core::fixup::Fixup;
use crate::core::instruction::{Instruction, OperandKind, OperandResolution};
use crate::core::segment::{ByteAttribute, ByteKind};
use crate::core::xref::{XRef, XRefType};
use crate::disasm::{DecodeError, Decoder};
use crate::image::Image;

/// Why no instruction could be produced at an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("address is outside the image")]
    OutOfImage,
    #[error("{0}")]
    Decode(#[from] DecodeError),
}

/// An instruction decoded in place, with fixups applied.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub instruction: Instruction,
    pub location: Location,
    /// Fixups inside the instruction that matched no operand
    pub broken: Vec<Fixup>,
}

impl Decoded {
    pub fn is_clean(&self) -> bool {
        self.broken.is_empty()
    }
}

/// Decode the instruction at `address` and tag its operands.
///
/// Operands covered exactly by a fixup become symbolic. Untagged branch
/// operands get their concrete target. Byte attributes are not consulted,
/// so this also serves listings of code that was already analyzed.
pub fn decode_at(
    image: &dyn Image,
    decoder: &dyn Decoder,
    address: Address,
) -> Result<Decoded, StepError> {
    let location = image.locate(address).ok_or(StepError::OutOfImage)?;
    let segment = image
        .segment(location.segment)
        .ok_or(StepError::OutOfImage)?;
    let bytes = segment
        .data()
        .get(location.index..)
        .ok_or(StepError::OutOfImage)?;
    let mut instruction = decoder.decode(bytes, address.offset)?;

    let alignment = segment.fixups().align(&instruction, location.index);
    for (index, target) in alignment.tags {
        if let Some(operand) = instruction.operands.get_mut(index) {
            operand.resolution = OperandResolution::Symbolic(target);
        }
    }
    let length = i32::from(instruction.length);
    for operand in instruction
        .operands
        .iter_mut()
        .filter(|op| !op.resolution.is_resolved())
    {
        let target = match operand.kind {
            OperandKind::NearBranch { displacement } => {
                address.checked_add(length + i32::from(displacement))
            }
            OperandKind::FarBranch { selector, offset } => Some(Address::new(selector, offset)),
            _ => None,
        };
        if let Some(target) = target {
            operand.resolution = OperandResolution::Concrete(target);
        }
    }

    Ok(Decoded {
        instruction,
        location,
        broken: alignment.broken,
    })
}

/// Split the block containing `location` so that a block starts at `at`.
///
/// Byte owners of both halves are updated. Returns false when no block
/// covers `location` or it already starts there.
pub(crate) fn split_block(
    image: &mut dyn Image,
    blocks: &mut BasicBlockStore,
    at: Address,
    location: Location,
) -> bool {
    let Some(id) = blocks.containing(location) else {
        return false;
    };
    let Some((head, tail)) = blocks.split(id, at, location) else {
        return false;
    };
    for part in [head, tail] {
        let Some(range) = blocks.get(part).map(BasicBlock::byte_range) else {
            continue;
        };
        if let Some(segment) = image.segment_mut(location.segment) {
            segment.set_owner(range, part);
        }
    }
    true
}

pub struct Engine<'a> {
    image: &'a mut dyn Image,
    decoder: &'a dyn Decoder,
    session: &'a mut Session,
    config: &'a AnalysisConfig,
    worklist: Worklist,
}

impl<'a> Engine<'a> {
    pub fn new(
        image: &'a mut dyn Image,
        decoder: &'a dyn Decoder,
        session: &'a mut Session,
        config: &'a AnalysisConfig,
    ) -> Self {
        Self {
            image,
            decoder,
            session,
            config,
            worklist: Worklist::new(),
        }
    }

    /// Seed the worklist with `entries` and process it until empty.
    pub fn run(mut self, entries: &[EntryPoint]) {
        for entry in entries {
            let xref = XRef::new(None, Some(entry.address), entry.kind);
            if !self.session.entries.contains(entry) {
                self.session.entries.push(*entry);
                self.session.xrefs.add(xref);
            }
            self.worklist.push(xref);
        }
        let mut processed = 0usize;
        while let Some(xref) = self.worklist.pop() {
            self.process(xref);
            processed += 1;
        }
        debug!(processed, "worklist drained");
    }

    fn process(&mut self, xref: XRef) {
        if xref.is_table_probe() {
            self.probe_table(xref);
            return;
        }
        let Some(target) = xref.target else {
            return;
        };
        let Some(location) = self.image.locate(target) else {
            self.report(
                xref.source.or(Some(target)),
                Severity::Error,
                ErrorCode::OutOfImage,
                "Target {0} is outside the image",
                vec![self.image.format_address(target)],
            );
            return;
        };
        let Some(attribute) = self.attribute(location) else {
            return;
        };
        match attribute.kind() {
            ByteKind::Unknown => self.analyze_run(target, location),
            ByteKind::Code => {
                self.enter_code(target, location, attribute);
            }
            ByteKind::Data => self.report(
                Some(target),
                Severity::Error,
                ErrorCode::RanIntoData,
                "Flow from {0} reaches data at {1}",
                vec![
                    xref.source
                        .map_or_else(|| "entry".to_string(), |s| self.image.format_address(s)),
                    self.image.format_address(target),
                ],
            ),
        }
    }

    fn attribute(&self, location: Location) -> Option<ByteAttribute> {
        self.image
            .segment(location.segment)?
            .attribute(location.index)
    }

    /// Flow reaching a byte that is already code.
    ///
    /// Returns true when `target` is (or now is) the start of a block.
    fn enter_code(&mut self, target: Address, location: Location, attribute: ByteAttribute) -> bool {
        if self.session.blocks.starting_at(location).is_some() {
            return true;
        }
        if !attribute.is_lead_byte() {
            self.report(
                Some(target),
                Severity::Error,
                ErrorCode::RanIntoCode,
                "Flow reaches the middle of an instruction at {0}",
                vec![self.image.format_address(target)],
            );
            return false;
        }
        self.split_block(target, location);
        true
    }

    fn split_block(&mut self, at: Address, location: Location) {
        split_block(&mut *self.image, &mut self.session.blocks, at, location);
    }

    /// Decode forward from `start` and record the resulting block.
    fn analyze_run(&mut self, start: Address, first: Location) {
        let mut address = start;
        let mut index = first.index;

        let termination = loop {
            let decoded = match decode_at(&*self.image, self.decoder, address) {
                Ok(decoded) => decoded,
                Err(StepError::OutOfImage) => {
                    self.report(
                        Some(address),
                        Severity::Error,
                        ErrorCode::OutOfImage,
                        "Code runs off the end of the segment at {0}",
                        vec![self.image.format_address(address)],
                    );
                    break BlockTermination::Broken;
                }
                Err(StepError::Decode(err)) => {
                    self.report(
                        Some(address),
                        Severity::Error,
                        ErrorCode::InvalidInstruction,
                        "Cannot decode instruction at {0}: {1}",
                        vec![self.image.format_address(address), err.to_string()],
                    );
                    break BlockTermination::Broken;
                }
            };
            let instruction = &decoded.instruction;
            let length = usize::from(instruction.length);

            if instruction.next_ip() > 0x1_0000 {
                self.report(
                    Some(address),
                    Severity::Error,
                    ErrorCode::AddressWrapped,
                    "Instruction at {0} wraps past the end of the segment",
                    vec![self.image.format_address(address)],
                );
                break BlockTermination::Broken;
            }
            let marked = self
                .image
                .segment_mut(first.segment)
                .is_some_and(|segment| segment.mark_code(index..index + length));
            if !marked {
                self.report(
                    Some(address),
                    Severity::Error,
                    ErrorCode::OverlappingInstruction,
                    "Instruction at {0} overlaps bytes already analyzed",
                    vec![self.image.format_address(address)],
                );
                break BlockTermination::Broken;
            }
            trace!(address = %address, text = %instruction.text(), "decoded");
            index += length;

            if !decoded.is_clean() && self.report_broken_fixups(address, &decoded) {
                break BlockTermination::Broken;
            }
            if let Some(termination) = flow::terminator(instruction, self.config) {
                break termination;
            }
            if let Some(kind) = flow::classify(instruction) {
                self.record_flow(address, instruction, kind);
                match kind {
                    XRefType::ConditionalJump => {
                        self.record_fallthrough(address, instruction);
                        break BlockTermination::Branch;
                    }
                    XRefType::NearJump | XRefType::FarJump => break BlockTermination::Jump,
                    _ => {}
                }
            }

            let Ok(next) = u16::try_from(instruction.next_ip()) else {
                self.report(
                    Some(address),
                    Severity::Error,
                    ErrorCode::AddressWrapped,
                    "Execution continues past the end of the segment after {0}",
                    vec![self.image.format_address(address)],
                );
                break BlockTermination::Broken;
            };
            address = address.with_offset(next);
            let next_location = Location::new(first.segment, index);
            if let Some(attribute) = self.attribute(next_location) {
                if attribute.kind() == ByteKind::Code {
                    break if self.enter_code(address, next_location, attribute) {
                        BlockTermination::FallThrough
                    } else {
                        BlockTermination::Broken
                    };
                }
            }
        };

        let length = index - first.index;
        if length == 0 {
            return;
        }
        let block = BasicBlock::new(start, first, length, termination);
        debug!(block = %block, "new basic block");
        let id = self.session.blocks.insert(block);
        if let Some(segment) = self.image.segment_mut(first.segment) {
            segment.set_owner(first.index..index, id);
        }
    }

    /// Report fixups that do not align. Returns true if any is fatal.
    fn report_broken_fixups(&mut self, address: Address, decoded: &Decoded) -> bool {
        let mut fatal = false;
        let text = decoded.instruction.text();
        for fixup in &decoded.broken {
            let name = self
                .image
                .referent_name(fixup.target.referent)
                .unwrap_or_else(|| fixup.target.to_string());
            let helper = matches!(fixup.target.referent, Referent::External(_))
                && self.config.is_emulator_helper(&name);
            let severity = if helper {
                Severity::Warning
            } else {
                fatal = true;
                Severity::Error
            };
            let location = self
                .image
                .address_at(address, Location::new(decoded.location.segment, fixup.start))
                .unwrap_or(address);
            self.report(
                Some(location),
                severity,
                ErrorCode::BrokenFixup,
                "Fixup to {0} does not line up with an operand of '{1}'",
                vec![name, text.clone()],
            );
        }
        fatal
    }

    fn record_flow(&mut self, source: Address, instruction: &Instruction, kind: XRefType) {
        match flow::resolve_target(&*self.image, instruction, source, self.config) {
            FlowTarget::Resolved(target) => {
                let xref = XRef::new(Some(source), Some(target), kind);
                self.session.xrefs.add(xref);
                if !kind.is_call() || self.config.follow_calls {
                    self.worklist.push(xref);
                }
            }
            FlowTarget::Indexed { slot } => {
                debug!(jump = %source, slot = %slot, "jump table");
                self.worklist.push(XRef::table_probe(source, slot));
            }
            FlowTarget::Wrapped => {
                self.session.xrefs.add(XRef::new(Some(source), None, kind));
                self.report(
                    Some(source),
                    Severity::Error,
                    ErrorCode::AddressWrapped,
                    "Branch target of {0} wraps around the segment",
                    vec![self.image.format_address(source)],
                );
            }
            FlowTarget::Dynamic => {
                self.session.xrefs.add(XRef::new(Some(source), None, kind));
                self.report(
                    Some(source),
                    Severity::Message,
                    ErrorCode::DynamicTarget,
                    "Target of '{0}' is not known statically",
                    vec![instruction.text()],
                );
            }
        }
    }

    /// Not-taken edge of a conditional jump.
    fn record_fallthrough(&mut self, source: Address, instruction: &Instruction) {
        match u16::try_from(instruction.next_ip()) {
            Ok(next) => {
                let xref = XRef::new(
                    Some(source),
                    Some(source.with_offset(next)),
                    XRefType::ConditionalJump,
                );
                self.session.xrefs.add(xref);
                self.worklist.push(xref);
            }
            Err(_) => self.report(
                Some(source),
                Severity::Error,
                ErrorCode::AddressWrapped,
                "Execution continues past the end of the segment after {0}",
                vec![self.image.format_address(source)],
            ),
        }
    }

    fn probe_table(&mut self, xref: XRef) {
        let (Some(jump), Some(slot)) = (xref.source, xref.data_location) else {
            return;
        };
        let Some(entry) = jump_table::probe(&mut *self.image, jump, slot) else {
            debug!(jump = %jump, slot = %slot, "jump table ends");
            return;
        };
        let resolved = XRef::new(Some(jump), Some(entry.target), XRefType::NearIndexedJump)
            .with_data_location(slot);
        self.session.xrefs.add(resolved);
        self.session.table_slots.push(TableSlot {
            jump,
            slot,
            location: entry.slot_location,
        });
        self.worklist.push(resolved);
        if let Some(next) = entry.next {
            self.worklist.push(XRef::table_probe(jump, next));
        }
    }

    fn report(
        &mut self,
        location: Option<Address>,
        severity: Severity,
        code: ErrorCode,
        template: &str,
        args: Vec<String>,
    ) {
        self.session
            .errors
            .push(Diagnostic::new(location, severity, code, template, args));
    }
}
