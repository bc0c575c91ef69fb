//! Fixup records and their alignment against decoded operands.
//!
//! A fixup patches bytes of a segment at link or load time. For analysis it
//! tells us which operand refers to which symbolic target. A fixup is aligned
//! to an operand when its byte span equals the operand's fixable span; any
//! partial overlap is a broken fixup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

use crate::core::address::SymbolicTarget;
use crate::core::instruction::{Instruction, OperandKind};
use crate::error::{Result, ScathaError};

/// Which bytes a fixup patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FixupKind {
    /// Low byte of an offset
    LowByte,
    /// 16-bit offset
    Offset,
    /// 16-bit segment base (paragraph)
    Base,
    /// 32-bit `segment:offset` pointer
    Pointer,
}

impl FixupKind {
    pub fn width(&self) -> usize {
        match self {
            FixupKind::LowByte => 1,
            FixupKind::Offset | FixupKind::Base => 2,
            FixupKind::Pointer => 4,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FixupKind::LowByte => "lobyte",
            FixupKind::Offset => "offset",
            FixupKind::Base => "base",
            FixupKind::Pointer => "pointer",
        }
    }
}

/// How the patched value is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FixupMode {
    SelfRelative,
    SegmentRelative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fixup {
    /// Byte index of the first patched byte in the segment
    pub start: usize,
    pub kind: FixupKind,
    pub mode: FixupMode,
    pub target: SymbolicTarget,
}

impl Fixup {
    pub fn new(start: usize, kind: FixupKind, mode: FixupMode, target: SymbolicTarget) -> Self {
        Self {
            start,
            kind,
            mode,
            target,
        }
    }

    /// Exclusive end of the patched span.
    pub fn end(&self) -> usize {
        self.start + self.kind.width()
    }

    pub fn span(&self) -> Range<usize> {
        self.start..self.end()
    }
}

impl fmt::Display for Fixup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#06x} {} -> {}",
            self.start,
            self.kind.as_str(),
            self.target
        )
    }
}

/// Sorted, non-overlapping fixups of one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixupTable {
    fixups: Vec<Fixup>,
}

/// Outcome of aligning one instruction against the fixup table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixupAlignment {
    /// Operand index and the target it was tagged with
    pub tags: Vec<(usize, SymbolicTarget)>,
    /// Fixups touching the instruction that matched no operand exactly
    pub broken: Vec<Fixup>,
}

impl FixupAlignment {
    pub fn is_clean(&self) -> bool {
        self.broken.is_empty()
    }
}

impl FixupTable {
    /// Build a table, sorting by start and rejecting overlaps.
    pub fn new(mut fixups: Vec<Fixup>) -> Result<Self> {
        fixups.sort_by_key(|f| f.start);
        for pair in fixups.windows(2) {
            if pair[0].end() > pair[1].start {
                return Err(ScathaError::OverlappingFixups {
                    first: pair[0].start,
                    second: pair[1].start,
                });
            }
        }
        Ok(Self { fixups })
    }

    pub fn len(&self) -> usize {
        self.fixups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fixup> {
        self.fixups.iter()
    }

    /// Fixup starting exactly at `start`.
    pub fn at(&self, start: usize) -> Option<&Fixup> {
        self.fixups
            .binary_search_by_key(&start, |f| f.start)
            .ok()
            .map(|i| &self.fixups[i])
    }

    /// Index of the first fixup whose span ends after `offset`.
    fn first_reaching(&self, offset: usize) -> usize {
        self.fixups.partition_point(|f| f.end() <= offset)
    }

    /// Fixups intersecting `range`.
    pub fn intersecting(&self, range: Range<usize>) -> &[Fixup] {
        let first = self.first_reaching(range.start);
        let count = self.fixups[first..]
            .iter()
            .take_while(|f| f.start < range.end)
            .count();
        &self.fixups[first..first + count]
    }

    /// Match the fixups covering `instruction` (placed at byte `start`)
    /// against its operands.
    ///
    /// Pure: the same instruction and table always give the same result.
    pub fn align(&self, instruction: &Instruction, start: usize) -> FixupAlignment {
        let end = start + usize::from(instruction.length);
        let candidates = self.intersecting(start..end);
        let mut handled = vec![false; candidates.len()];
        let mut result = FixupAlignment::default();

        let mut spans: Vec<(usize, Range<usize>)> = (0..instruction.operands.len())
            .filter_map(|i| instruction.operand_span(i, start).map(|s| (i, s)))
            .filter(|(_, s)| !s.is_empty())
            .collect();
        spans.sort_by_key(|(_, s)| s.start);

        let mut cursor = 0;
        for (index, span) in spans {
            while cursor < candidates.len() && candidates[cursor].end() <= span.start {
                cursor += 1;
            }
            let Some(fixup) = candidates.get(cursor) else {
                break;
            };
            if fixup.start >= span.end {
                continue;
            }
            handled[cursor] = true;
            cursor += 1;
            match aligned_target(instruction, index, &span, fixup) {
                Some(target) => result.tags.push((index, target)),
                None => result.broken.push(*fixup),
            }
        }

        for (fixup, done) in candidates.iter().zip(handled) {
            if !done {
                result.broken.push(*fixup);
            }
        }
        result.broken.sort_by_key(|f| f.start);
        result
    }
}

/// Target to tag operand `index` with, if `fixup` fits its span exactly.
fn aligned_target(
    instruction: &Instruction,
    index: usize,
    span: &Range<usize>,
    fixup: &Fixup,
) -> Option<SymbolicTarget> {
    if fixup.span() == *span {
        return Some(fixup.target);
    }
    // A far pointer may carry only a base fixup on its selector word; the
    // offset half then comes from the instruction bytes.
    if let OperandKind::FarBranch { offset, .. } = instruction.operands[index].kind {
        if fixup.kind == FixupKind::Base && fixup.span() == (span.start + 2..span.end) {
            return Some(SymbolicTarget::new(fixup.target.referent, offset));
        }
    }
    None
}
