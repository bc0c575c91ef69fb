//! Heuristic recovery of near jump tables.
//!
//! Only the common compiler idiom `jmp word ptr cs:[bx+TABLE]` is
//! recognized. The table's length is unknown, so slots are probed one at a
//! time and the table is considered finished at the first slot that
//! is already classified, lies past the jump's own segment, would wrap,
//! or holds a value that points outside the image.
//! Imprecise by nature: hand-written tables may be under- or over-read.

use iced_x86::{Code, Register};

use crate::core::address::{Address, Location};
use crate::core::instruction::{Instruction, OperandKind};
use crate::image::Image;

/// True for a near JMP through `cs:[base+disp]` with no index register.
pub fn is_table_jump(instruction: &Instruction) -> bool {
    if instruction.code != Code::Jmp_rm16 {
        return false;
    }
    matches!(
        instruction.memory_operand().map(|op| op.kind),
        Some(OperandKind::Memory {
            segment_prefix: Register::CS,
            base,
            index: Register::None,
            ..
        }) if base != Register::None
    )
}

/// First slot of the table addressed by a table jump at `source`.
///
/// A fixup on the displacement names the table symbolically; otherwise the
/// displacement is an offset in the jump's own segment.
pub fn first_slot(image: &dyn Image, instruction: &Instruction, source: Address) -> Option<Address> {
    let operand = instruction.memory_operand()?;
    if let Some(target) = operand.resolution.symbolic() {
        return image.resolve(target);
    }
    match operand.kind {
        OperandKind::Memory { displacement, .. } => Some(source.with_offset(displacement)),
        _ => None,
    }
}

/// One successfully read table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    /// Jump target read from the slot
    pub target: Address,
    pub slot: Address,
    pub slot_location: Location,
    /// Slot to probe next, if it does not wrap
    pub next: Option<Address>,
}

/// Read one slot of the table used by the jump at `jump`.
///
/// On success the slot's two bytes are marked as data. Returns `None` when
/// the table is considered finished.
pub fn probe(image: &mut dyn Image, jump: Address, slot: Address) -> Option<TableEntry> {
    if slot.offset >= 0xFFFE {
        return None;
    }
    if image.segment_ordinal(slot)? > image.segment_ordinal(jump)? {
        return None;
    }
    let location = image.locate(slot)?;
    let second = image.locate(slot.checked_add(1)?)?;
    if second != Location::new(location.segment, location.index + 1) {
        return None;
    }
    let segment = image.segment(location.segment)?;
    if !segment.is_unknown_range(location.index..location.index + 2) {
        return None;
    }
    let target = jump.with_offset(segment.read_u16(location.index)?);
    // a value outside the image is not a slot; the bytes stay unknown
    if !image.is_address_valid(target) {
        return None;
    }
    image
        .segment_mut(location.segment)?
        .mark_data(location.index..location.index + 2);
    let entry = TableEntry {
        target,
        slot,
        slot_location: location,
        next: slot.checked_add(2),
    };
    tracing::debug!(jump = %jump, slot = %slot, target = %entry.target, "jump table slot");
    Some(entry)
}
