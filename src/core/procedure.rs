//! Procedures recovered from call targets, entry points and symbols.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Range;

use crate::core::address::{Address, Location};
use crate::core::basic_block::{BasicBlockStore, BlockId};

/// How a procedure is entered and left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallType {
    Near,
    Far,
}

impl CallType {
    pub fn as_str(&self) -> &str {
        match self {
            CallType::Near => "near",
            CallType::Far => "far",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Procedure {
    pub entry: Address,
    pub entry_location: Location,
    pub call_type: CallType,
    /// Blocks reachable from the entry without following calls
    pub blocks: BTreeSet<BlockId>,
    /// Data owned by the procedure (jump-table slots), as byte ranges
    pub data: Vec<(usize, Range<usize>)>,
    pub name: Option<String>,
}

impl Procedure {
    pub fn new(entry: Address, entry_location: Location, call_type: CallType) -> Self {
        Self {
            entry,
            entry_location,
            call_type,
            blocks: BTreeSet::new(),
            data: Vec::new(),
            name: None,
        }
    }

    /// Symbol name, or `sub_SSSS_OOOO` when none is known.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("sub_{:04X}_{:04X}", self.entry.segment, self.entry.offset),
        }
    }

    /// Byte ranges of member blocks as (segment index, range), merged and sorted.
    pub fn code_ranges(&self, blocks: &BasicBlockStore) -> Vec<(usize, Range<usize>)> {
        let mut ranges: Vec<(usize, Range<usize>)> = self
            .blocks
            .iter()
            .filter_map(|&id| blocks.get(id))
            .map(|b| (b.location.segment, b.byte_range()))
            .collect();
        ranges.sort_by_key(|(seg, r)| (*seg, r.start));
        let mut merged: Vec<(usize, Range<usize>)> = Vec::with_capacity(ranges.len());
        for (seg, range) in ranges {
            match merged.last_mut() {
                Some((last_seg, last)) if *last_seg == seg && last.end == range.start => {
                    last.end = range.end;
                }
                _ => merged.push((seg, range)),
            }
        }
        merged
    }

    pub fn data_ranges(&self) -> &[(usize, Range<usize>)] {
        &self.data
    }

    /// Code plus data bytes.
    pub fn byte_length(&self, blocks: &BasicBlockStore) -> usize {
        let code: usize = self.code_ranges(blocks).iter().map(|(_, r)| r.len()).sum();
        let data: usize = self.data.iter().map(|(_, r)| r.len()).sum();
        code + data
    }

    pub fn add_data(&mut self, segment: usize, range: Range<usize>) {
        if !self.data.iter().any(|(s, r)| *s == segment && *r == range) {
            self.data.push((segment, range));
        }
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} ({} blocks)",
            self.entry,
            self.call_type.as_str(),
            self.display_name(),
            self.blocks.len()
        )
    }
}

/// Procedures keyed by entry location.
#[derive(Debug, Clone, Default)]
pub struct ProcedureStore {
    procedures: BTreeMap<Location, Procedure>,
}

impl ProcedureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entry: Location) -> Option<&Procedure> {
        self.procedures.get(&entry)
    }

    pub fn get_mut(&mut self, entry: Location) -> Option<&mut Procedure> {
        self.procedures.get_mut(&entry)
    }

    pub fn contains(&self, entry: Location) -> bool {
        self.procedures.contains_key(&entry)
    }

    pub fn insert(&mut self, procedure: Procedure) {
        tracing::debug!(procedure = %procedure, "new procedure");
        self.procedures.insert(procedure.entry_location, procedure);
    }

    pub fn by_name(&self, name: &str) -> Option<&Procedure> {
        self.procedures
            .values()
            .find(|p| p.name.as_deref() == Some(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Procedure> {
        self.procedures.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Procedure> {
        self.procedures.values_mut()
    }

    pub fn entries(&self) -> BTreeSet<Location> {
        self.procedures.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::basic_block::{BasicBlock, BlockTermination};

    #[test]
    fn test_display_name() {
        let mut p = Procedure::new(Address::new(0x12, 0x340), Location::new(0, 0x460), CallType::Far);
        assert_eq!(p.display_name(), "sub_0012_0340");
        p.name = Some("_main".to_string());
        assert_eq!(p.display_name(), "_main");
    }

    #[test]
    fn test_ranges_and_length() {
        let mut store = BasicBlockStore::new();
        let a = store.insert(BasicBlock::new(
            Address::new(0, 0),
            Location::new(0, 0),
            4,
            BlockTermination::FallThrough,
        ));
        let b = store.insert(BasicBlock::new(
            Address::new(0, 4),
            Location::new(0, 4),
            3,
            BlockTermination::Jump,
        ));
        let c = store.insert(BasicBlock::new(
            Address::new(0, 0x10),
            Location::new(0, 0x10),
            1,
            BlockTermination::Return,
        ));
        let mut p = Procedure::new(Address::new(0, 0), Location::new(0, 0), CallType::Near);
        p.blocks.extend([a, b, c]);
        p.add_data(0, 0x20..0x22);
        p.add_data(0, 0x20..0x22);
        assert_eq!(p.code_ranges(&store), vec![(0, 0..7), (0, 0x10..0x11)]);
        assert_eq!(p.byte_length(&store), 10);
        assert_eq!(p.data_ranges().len(), 1);
    }

    #[test]
    fn test_store_lookup() {
        let mut procs = ProcedureStore::new();
        let mut p = Procedure::new(Address::new(1, 0), Location::new(1, 0), CallType::Near);
        p.name = Some("_strlen".to_string());
        procs.insert(p);
        assert!(procs.contains(Location::new(1, 0)));
        assert_eq!(procs.by_name("_strlen").map(|p| p.entry), Some(Address::new(1, 0)));
        assert_eq!(procs.len(), 1);
    }
}
