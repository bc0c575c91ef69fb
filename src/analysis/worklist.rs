//! Priority worklist of cross references waiting to be analyzed.
//!
//! Resolved jumps come first, then calls, then caller-supplied entries.
//! Pending jump-table probes always come last so that a table's extent is
//! bounded by code found through other paths before its slots are read.
//! Entries of equal rank leave in insertion order.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::core::xref::{XRef, XRefType};

fn rank(xref: &XRef) -> u8 {
    if xref.is_table_probe() {
        return 0;
    }
    match xref.kind {
        XRefType::ConditionalJump
        | XRefType::NearJump
        | XRefType::FarJump
        | XRefType::NearIndexedJump => 3,
        XRefType::NearCall | XRefType::FarCall => 2,
        XRefType::UserSpecified => 1,
    }
}

#[derive(Debug)]
struct Entry {
    rank: u8,
    seq: Reverse<u64>,
    xref: XRef,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.rank, self.seq).cmp(&(other.rank, other.seq))
    }
}

#[derive(Debug, Default)]
pub struct Worklist {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl Worklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, xref: XRef) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            rank: rank(&xref),
            seq: Reverse(seq),
            xref,
        });
    }

    pub fn pop(&mut self) -> Option<XRef> {
        self.heap.pop().map(|e| e.xref)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::Address;

    fn xref(kind: XRefType, offset: u16) -> XRef {
        XRef::new(Some(Address::new(0, 0)), Some(Address::new(0, offset)), kind)
    }

    #[test]
    fn test_probes_come_last() {
        let mut list = Worklist::new();
        list.push(XRef::table_probe(Address::new(0, 0), Address::new(0, 0x100)));
        list.push(xref(XRefType::UserSpecified, 1));
        list.push(xref(XRefType::NearCall, 2));
        list.push(xref(XRefType::NearIndexedJump, 3));
        list.push(xref(XRefType::ConditionalJump, 4));
        let order: Vec<(XRefType, Option<u16>)> = std::iter::from_fn(|| list.pop())
            .map(|x| (x.kind, x.target.map(|t| t.offset)))
            .collect();
        assert_eq!(
            order,
            vec![
                (XRefType::NearIndexedJump, Some(3)),
                (XRefType::ConditionalJump, Some(4)),
                (XRefType::NearCall, Some(2)),
                (XRefType::UserSpecified, Some(1)),
                (XRefType::NearIndexedJump, None),
            ]
        );
    }

    #[test]
    fn test_fifo_within_rank() {
        let mut list = Worklist::new();
        for offset in [5, 1, 9] {
            list.push(xref(XRefType::NearJump, offset));
        }
        assert_eq!(list.len(), 3);
        let order: Vec<u16> = std::iter::from_fn(|| list.pop())
            .filter_map(|x| x.target.map(|t| t.offset))
            .collect();
        assert_eq!(order, vec![5, 1, 9]);
        assert!(list.is_empty());
    }
}
