//! Segment type and the per-byte attribute store.
//!
//! A segment owns one contiguous run of image bytes, the attribute of every
//! byte (unknown / code / data, lead-byte flag, owning basic block) and the
//! fixups that patch it. Segments belong to the image and outlive any single
//! analysis session.
//!
//! Attributes only move forward: a byte marked as code or data is never
//! turned back into an unknown byte.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

use crate::core::basic_block::BlockId;
use crate::core::fixup::FixupTable;

bitflags! {
    /// Raw attribute bits stored per byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ByteFlags: u8 {
        /// Byte belongs to a decoded instruction
        const CODE = 0b001;
        /// Byte belongs to a data item
        const DATA = 0b010;
        /// First byte of an instruction or data item
        const LEAD = 0b100;
    }
}

/// Classification of a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ByteKind {
    Unknown,
    Code,
    Data,
}

impl ByteKind {
    pub fn as_str(&self) -> &str {
        match self {
            ByteKind::Unknown => "unknown",
            ByteKind::Code => "code",
            ByteKind::Data => "data",
        }
    }
}

/// Metadata attached to one byte of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteAttribute {
    flags: ByteFlags,
    block: Option<BlockId>,
}

impl ByteAttribute {
    pub fn kind(&self) -> ByteKind {
        if self.flags.contains(ByteFlags::CODE) {
            ByteKind::Code
        } else if self.flags.contains(ByteFlags::DATA) {
            ByteKind::Data
        } else {
            ByteKind::Unknown
        }
    }

    pub fn is_lead_byte(&self) -> bool {
        self.flags.contains(ByteFlags::LEAD)
    }

    pub fn is_unknown(&self) -> bool {
        self.kind() == ByteKind::Unknown
    }

    /// Basic block covering this byte, for code bytes.
    pub fn block(&self) -> Option<BlockId> {
        self.block
    }

    pub fn flags(&self) -> ByteFlags {
        self.flags
    }
}

/// One contiguous run of image bytes with attributes and fixups.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Segment name (e.g. `_TEXT`), or a synthetic name for executables
    pub name: String,
    /// Class name from the object file (e.g. `CODE`), if any
    pub class: Option<String>,
    /// Index of the module that defined this segment
    pub module: Option<usize>,
    data: Vec<u8>,
    attributes: Vec<ByteAttribute>,
    fixups: FixupTable,
}

impl Segment {
    /// Create a segment over `data` with every byte unknown and no fixups.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        let attributes = vec![ByteAttribute::default(); data.len()];
        Self {
            name: name.into(),
            class: None,
            module: None,
            data,
            attributes,
            fixups: FixupTable::default(),
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn with_fixups(mut self, fixups: FixupTable) -> Self {
        self.fixups = fixups;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn fixups(&self) -> &FixupTable {
        &self.fixups
    }

    /// True when the class name marks this as a code segment.
    pub fn is_code_class(&self) -> bool {
        self.class
            .as_deref()
            .map(|c| c.to_ascii_uppercase().contains("CODE"))
            .unwrap_or(false)
    }

    pub fn attribute(&self, index: usize) -> Option<ByteAttribute> {
        self.attributes.get(index).copied()
    }

    pub fn kind(&self, index: usize) -> Option<ByteKind> {
        self.attribute(index).map(|a| a.kind())
    }

    /// Read a little-endian word.
    pub fn read_u16(&self, index: usize) -> Option<u16> {
        self.data
            .get(index..index.checked_add(2)?)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    /// True if every byte of `range` exists and is still unknown.
    pub fn is_unknown_range(&self, range: Range<usize>) -> bool {
        match self.attributes.get(range) {
            Some(attrs) => attrs.iter().all(ByteAttribute::is_unknown),
            None => false,
        }
    }

    /// Mark an unknown range as one instruction.
    ///
    /// Returns false (and changes nothing) if any byte is already classified.
    pub fn mark_code(&mut self, range: Range<usize>) -> bool {
        self.mark(range, ByteFlags::CODE)
    }

    /// Mark an unknown range as one data item.
    pub fn mark_data(&mut self, range: Range<usize>) -> bool {
        self.mark(range, ByteFlags::DATA)
    }

    fn mark(&mut self, range: Range<usize>, kind: ByteFlags) -> bool {
        if range.is_empty() || !self.is_unknown_range(range.clone()) {
            return false;
        }
        let start = range.start;
        for (i, attr) in self.attributes[range].iter_mut().enumerate() {
            attr.flags = if i == 0 { kind | ByteFlags::LEAD } else { kind };
        }
        tracing::trace!(segment = %self.name, index = start, kind = ?kind, "marked bytes");
        true
    }

    /// Record `block` as the owner of every code byte in `range`.
    pub fn set_owner(&mut self, range: Range<usize>, block: BlockId) {
        let end = range.end.min(self.attributes.len());
        let start = range.start.min(end);
        for attr in &mut self.attributes[start..end] {
            if attr.flags.contains(ByteFlags::CODE) {
                attr.block = Some(block);
            }
        }
    }

    /// Iterate over maximal runs of bytes with the same kind.
    pub fn runs(&self) -> Vec<(Range<usize>, ByteKind)> {
        let mut out = Vec::new();
        let mut start = 0;
        for i in 1..=self.attributes.len() {
            let boundary = i == self.attributes.len()
                || self.attributes[i].kind() != self.attributes[start].kind();
            if boundary {
                out.push((start..i, self.attributes[start].kind()));
                start = i;
            }
        }
        out
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes", self.name, self.data.len())?;
        if let Some(class) = &self.class {
            write!(f, ", class {}", class)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_segment_is_unknown() {
        let seg = Segment::new("_TEXT", vec![0x90; 8]);
        assert_eq!(seg.len(), 8);
        assert!(seg.is_unknown_range(0..8));
        assert_eq!(seg.kind(3), Some(ByteKind::Unknown));
        assert_eq!(seg.kind(8), None);
        assert!(!seg.is_unknown_range(6..9));
    }

    #[test]
    fn test_mark_code_sets_lead_byte() {
        let mut seg = Segment::new("_TEXT", vec![0; 8]);
        assert!(seg.mark_code(2..5));
        let lead = seg.attribute(2).unwrap();
        assert_eq!(lead.kind(), ByteKind::Code);
        assert!(lead.is_lead_byte());
        let tail = seg.attribute(3).unwrap();
        assert_eq!(tail.kind(), ByteKind::Code);
        assert!(!tail.is_lead_byte());
        assert_eq!(seg.kind(5), Some(ByteKind::Unknown));
    }

    #[test]
    fn test_marking_is_monotonic() {
        let mut seg = Segment::new("_DATA", vec![0; 4]);
        assert!(seg.mark_data(0..2));
        // Overlapping requests are refused and leave bytes untouched.
        assert!(!seg.mark_code(1..3));
        assert!(!seg.mark_data(0..2));
        assert_eq!(seg.kind(0), Some(ByteKind::Data));
        assert_eq!(seg.kind(1), Some(ByteKind::Data));
        assert_eq!(seg.kind(2), Some(ByteKind::Unknown));
    }

    #[test]
    fn test_set_owner_only_touches_code() {
        let mut seg = Segment::new("_TEXT", vec![0; 6]);
        seg.mark_code(0..3);
        seg.mark_data(3..5);
        seg.set_owner(0..6, BlockId(4));
        assert_eq!(seg.attribute(0).unwrap().block(), Some(BlockId(4)));
        assert_eq!(seg.attribute(2).unwrap().block(), Some(BlockId(4)));
        assert_eq!(seg.attribute(3).unwrap().block(), None);
        assert_eq!(seg.attribute(5).unwrap().block(), None);
    }

    #[test]
    fn test_runs_and_read() {
        let mut seg = Segment::new("_TEXT", vec![0x34, 0x12, 0, 0]).with_class("CODE");
        seg.mark_data(0..2);
        assert_eq!(seg.read_u16(0), Some(0x1234));
        assert_eq!(seg.read_u16(3), None);
        assert_eq!(
            seg.runs(),
            vec![(0..2, ByteKind::Data), (2..4, ByteKind::Unknown)]
        );
        assert!(seg.is_code_class());
        assert_eq!(seg.to_string(), "_TEXT (4 bytes, class CODE)");
    }
}
