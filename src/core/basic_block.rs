//! Basic blocks and the block store.
//!
//! A basic block is a run of instructions in one segment that is entered at
//! its first byte and left after its last instruction. Blocks never overlap.
//! When analysis later enters a block in the middle, the block is replaced by
//! two new blocks covering the same bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use crate::core::address::{Address, Location};

/// Handle of a block inside a [`BasicBlockStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub usize);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Why a block ends where it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockTermination {
    /// Never terminated; only seen on error paths
    Unknown,
    /// Decoding failed, overlapped other bytes, wrapped or hit a broken fixup
    Broken,
    /// Runs straight into the next block
    FallThrough,
    Jump,
    /// Conditional branch
    Branch,
    /// Kept for completeness; calls do not end blocks
    Call,
    Return,
    Halt,
}

impl BlockTermination {
    pub fn as_str(&self) -> &str {
        match self {
            BlockTermination::Unknown => "unknown",
            BlockTermination::Broken => "broken",
            BlockTermination::FallThrough => "fallthrough",
            BlockTermination::Jump => "jump",
            BlockTermination::Branch => "branch",
            BlockTermination::Call => "call",
            BlockTermination::Return => "return",
            BlockTermination::Halt => "halt",
        }
    }

    /// Whether execution can continue at the block's end.
    pub fn falls_through(&self) -> bool {
        matches!(
            self,
            BlockTermination::FallThrough | BlockTermination::Branch | BlockTermination::Call
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    /// Logical address of the first instruction
    pub start: Address,
    /// Byte slot of the first instruction
    pub location: Location,
    /// Length in bytes
    pub length: usize,
    pub termination: BlockTermination,
}

impl BasicBlock {
    pub fn new(
        start: Address,
        location: Location,
        length: usize,
        termination: BlockTermination,
    ) -> Self {
        Self {
            start,
            location,
            length,
            termination,
        }
    }

    /// Exclusive end offset; may be 0x10000 for a block that ends its segment.
    pub fn end_offset(&self) -> u32 {
        u32::from(self.start.offset) + self.length as u32
    }

    /// Exclusive end as an address, when it fits in 16 bits.
    pub fn end(&self) -> Option<Address> {
        u16::try_from(self.end_offset())
            .ok()
            .map(|offset| self.start.with_offset(offset))
    }

    /// Byte indices covered inside the segment store.
    pub fn byte_range(&self) -> Range<usize> {
        self.location.index..self.location.index + self.length
    }

    pub fn contains(&self, location: Location) -> bool {
        location.segment == self.location.segment && self.byte_range().contains(&location.index)
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, +{:#x}) {}",
            self.start,
            self.length,
            self.termination.as_str()
        )
    }
}

/// Slab of blocks indexed by start location.
#[derive(Debug, Clone, Default)]
pub struct BasicBlockStore {
    slots: Vec<Option<BasicBlock>>,
    by_location: BTreeMap<Location, BlockId>,
}

impl BasicBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, block: BasicBlock) -> BlockId {
        let id = BlockId(self.slots.len());
        self.by_location.insert(block.location, id);
        self.slots.push(Some(block));
        id
    }

    pub fn get(&self, id: BlockId) -> Option<&BasicBlock> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn remove(&mut self, id: BlockId) -> Option<BasicBlock> {
        let block = self.slots.get_mut(id.0)?.take()?;
        self.by_location.remove(&block.location);
        Some(block)
    }

    /// Block starting exactly at `location`.
    pub fn starting_at(&self, location: Location) -> Option<BlockId> {
        self.by_location.get(&location).copied()
    }

    /// Block whose range covers `location`.
    pub fn containing(&self, location: Location) -> Option<BlockId> {
        let (_, &id) = self.by_location.range(..=location).next_back()?;
        self.get(id)
            .filter(|block| block.contains(location))
            .map(|_| id)
    }

    /// Replace block `id` by a head ending at `at` and a tail starting there.
    ///
    /// `at` must lie strictly inside the block. The head becomes
    /// `FallThrough`; the tail keeps the original termination. Returns the
    /// new (head, tail) ids. Byte owners are left to the caller.
    pub fn split(&mut self, id: BlockId, at: Address, at_location: Location) -> Option<(BlockId, BlockId)> {
        let block = self.get(id)?;
        if !block.contains(at_location) || at_location == block.location {
            return None;
        }
        let block = self.remove(id)?;
        let head_len = at_location.index - block.location.index;
        let head = BasicBlock::new(
            block.start,
            block.location,
            head_len,
            BlockTermination::FallThrough,
        );
        let tail = BasicBlock::new(at, at_location, block.length - head_len, block.termination);
        tracing::debug!(block = %block, at = %at, "split basic block");
        Some((self.insert(head), self.insert(tail)))
    }

    pub fn len(&self) -> usize {
        self.by_location.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_location.is_empty()
    }

    /// Live blocks ordered by location.
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &BasicBlock)> {
        self.by_location
            .values()
            .filter_map(|&id| self.get(id).map(|block| (id, block)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(offset: u16, length: usize, termination: BlockTermination) -> BasicBlock {
        BasicBlock::new(
            Address::new(0, offset),
            Location::new(0, usize::from(offset)),
            length,
            termination,
        )
    }

    #[test]
    fn test_lookup() {
        let mut store = BasicBlockStore::new();
        let a = store.insert(block(0x10, 6, BlockTermination::Jump));
        let b = store.insert(block(0x20, 2, BlockTermination::Return));
        assert_eq!(store.starting_at(Location::new(0, 0x10)), Some(a));
        assert_eq!(store.starting_at(Location::new(0, 0x12)), None);
        assert_eq!(store.containing(Location::new(0, 0x15)), Some(a));
        assert_eq!(store.containing(Location::new(0, 0x16)), None);
        assert_eq!(store.containing(Location::new(0, 0x21)), Some(b));
        assert_eq!(store.containing(Location::new(1, 0x21)), None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_split_preserves_coverage() {
        let mut store = BasicBlockStore::new();
        let id = store.insert(block(0x100, 0x10, BlockTermination::Return));
        let (head, tail) = store
            .split(id, Address::new(0, 0x104), Location::new(0, 0x104))
            .unwrap();
        assert!(store.get(id).is_none());
        let head = store.get(head).unwrap();
        let tail = store.get(tail).unwrap();
        assert_eq!(head.start, Address::new(0, 0x100));
        assert_eq!(head.end(), Some(Address::new(0, 0x104)));
        assert_eq!(head.termination, BlockTermination::FallThrough);
        assert_eq!(tail.start, Address::new(0, 0x104));
        assert_eq!(tail.end(), Some(Address::new(0, 0x110)));
        assert_eq!(tail.termination, BlockTermination::Return);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_split_rejects_boundaries() {
        let mut store = BasicBlockStore::new();
        let id = store.insert(block(0x100, 0x10, BlockTermination::Jump));
        assert!(store
            .split(id, Address::new(0, 0x100), Location::new(0, 0x100))
            .is_none());
        assert!(store
            .split(id, Address::new(0, 0x110), Location::new(0, 0x110))
            .is_none());
        assert!(store.get(id).is_some());
    }

    #[test]
    fn test_end_at_segment_limit() {
        let b = block(0xFFFE, 2, BlockTermination::Return);
        assert_eq!(b.end_offset(), 0x10000);
        assert_eq!(b.end(), None);
    }
}
