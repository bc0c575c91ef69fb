//! Flat single-segment image of an MZ executable's load module.
//!
//! Addresses are real-mode `frame:offset` pairs relative to the start of the
//! load module, so the byte index of an address is `frame * 16 + offset`.
//! Relocation slots become `Base` fixups whose target is the frame stored in
//! the slot.

use std::collections::BTreeSet;

use crate::core::address::{Address, Location, Referent, SymbolicTarget};
use crate::core::fixup::{Fixup, FixupKind, FixupMode, FixupTable};
use crate::core::segment::Segment;
use crate::error::Result;
use crate::image::Image;

#[derive(Debug, Clone)]
pub struct ExecutableImage {
    segment: Segment,
    entry: Address,
    stack: Address,
    relocations: Vec<Address>,
    /// Frames known to start a segment
    frames: BTreeSet<u16>,
}

fn linear(address: Address) -> usize {
    usize::from(address.segment) * 16 + usize::from(address.offset)
}

impl ExecutableImage {
    /// Build an image from the load module bytes, entry `CS:IP`, initial
    /// `SS:SP` and relocation slot addresses.
    pub fn new(
        data: Vec<u8>,
        entry: Address,
        stack: Address,
        relocations: Vec<Address>,
    ) -> Result<Self> {
        let mut frames = BTreeSet::from([0, entry.segment]);
        let mut fixups = Vec::with_capacity(relocations.len());
        for slot in &relocations {
            let start = linear(*slot);
            let Some(value) = data
                .get(start..start + 2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
            else {
                tracing::warn!(slot = %slot, "relocation slot outside load module");
                continue;
            };
            frames.insert(slot.segment);
            frames.insert(value);
            fixups.push(Fixup::new(
                start,
                FixupKind::Base,
                FixupMode::SegmentRelative,
                SymbolicTarget::new(Referent::Frame(value), 0),
            ));
        }
        let segment = Segment::new("LOAD", data).with_fixups(FixupTable::new(fixups)?);
        tracing::debug!(
            bytes = segment.len(),
            relocations = relocations.len(),
            frames = frames.len(),
            "executable image"
        );
        Ok(Self {
            segment,
            entry,
            stack,
            relocations,
            frames,
        })
    }

    /// Initial `CS:IP`.
    pub fn entry(&self) -> Address {
        self.entry
    }

    /// Initial `SS:SP`.
    pub fn stack(&self) -> Address {
        self.stack
    }

    pub fn relocations(&self) -> &[Address] {
        &self.relocations
    }

    pub fn known_frames(&self) -> impl Iterator<Item = u16> + '_ {
        self.frames.iter().copied()
    }
}

impl Image for ExecutableImage {
    fn segment_count(&self) -> usize {
        1
    }

    fn segment(&self, index: usize) -> Option<&Segment> {
        (index == 0).then_some(&self.segment)
    }

    fn segment_mut(&mut self, index: usize) -> Option<&mut Segment> {
        (index == 0).then_some(&mut self.segment)
    }

    fn locate(&self, address: Address) -> Option<Location> {
        let index = linear(address);
        (index < self.segment.len()).then_some(Location::new(0, index))
    }

    fn address_at(&self, anchor: Address, location: Location) -> Option<Address> {
        if location.segment != 0 {
            return None;
        }
        let index = location.index;
        let frame = if index >= usize::from(anchor.segment) * 16 {
            anchor.segment
        } else {
            *self
                .frames
                .range(..)
                .rev()
                .find(|&&f| usize::from(f) * 16 <= index)?
        };
        let offset = u16::try_from(index - usize::from(frame) * 16).ok()?;
        Some(Address::new(frame, offset))
    }

    fn resolve(&self, target: &SymbolicTarget) -> Option<Address> {
        match target.referent {
            Referent::Frame(frame) => Some(Address::new(frame, target.displacement)),
            _ => None,
        }
    }

    /// Number of known frames at or below the address; frames stand in for
    /// segment boundaries, which an executable does not record.
    fn segment_ordinal(&self, address: Address) -> Option<usize> {
        let index = linear(address);
        Some(
            self.frames
                .iter()
                .filter(|&&f| usize::from(f) * 16 <= index)
                .count(),
        )
    }

    fn format_address(&self, address: Address) -> String {
        address.to_string()
    }

    fn referent_name(&self, referent: Referent) -> Option<String> {
        match referent {
            Referent::Frame(frame) => Some(format!("{:04X}", frame)),
            _ => None,
        }
    }

    fn symbols(&self) -> Vec<(Address, String)> {
        Vec::new()
    }
}
