//! Address types for 16-bit segmented code.
//!
//! Two representations coexist during analysis:
//!
//! * [`Address`] is a logical `segment:offset` pair. What the segment number
//!   means is up to the image: a dense segment index for object libraries, a
//!   real-mode frame for flat executables.
//! * [`SymbolicTarget`] names a [`Referent`] plus a displacement. It only
//!   becomes an [`Address`] once the image resolves the referent, which may
//!   fail (an external symbol that no loaded module defines).
//!
//! An invalid address is represented as `Option::<Address>::None`, which can
//! never compare equal to a real address.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical `segment:offset` location.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Address {
    /// Segment number (image-defined meaning)
    pub segment: u16,
    /// Byte offset within the segment
    pub offset: u16,
}

impl Address {
    /// Create a new Address.
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// Add a signed delta to the offset, staying in the same segment.
    ///
    /// Returns `None` when the result leaves the 16-bit addressable range.
    pub fn checked_add(self, delta: i32) -> Option<Self> {
        let value = i32::from(self.offset).checked_add(delta)?;
        u16::try_from(value)
            .ok()
            .map(|offset| Self::new(self.segment, offset))
    }

    /// Same segment, different offset.
    pub const fn with_offset(self, offset: u16) -> Self {
        Self::new(self.segment, offset)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.segment, self.offset)
    }
}

/// A resolved byte slot inside an image: which segment store, which byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    /// Index of the segment store in the image
    pub segment: usize,
    /// Byte index inside that store
    pub index: usize,
}

impl Location {
    pub const fn new(segment: usize, index: usize) -> Self {
        Self { segment, index }
    }
}

/// Any entity that can resolve to a logical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Referent {
    /// A logical segment by dense index
    Segment(u16),
    /// A segment group by dense index
    Group(u16),
    /// An external (undefined) symbol by dense index
    External(u32),
    /// An absolute paragraph frame
    Frame(u16),
}

impl Referent {
    pub fn as_str(&self) -> &str {
        match self {
            Referent::Segment(_) => "segment",
            Referent::Group(_) => "group",
            Referent::External(_) => "external",
            Referent::Frame(_) => "frame",
        }
    }
}

/// A deferred target: referent plus displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolicTarget {
    pub referent: Referent,
    pub displacement: u16,
}

impl SymbolicTarget {
    pub const fn new(referent: Referent, displacement: u16) -> Self {
        Self {
            referent,
            displacement,
        }
    }
}

impl fmt::Display for SymbolicTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.referent {
            Referent::Segment(i) => write!(f, "seg#{}", i)?,
            Referent::Group(i) => write!(f, "grp#{}", i)?,
            Referent::External(i) => write!(f, "ext#{}", i)?,
            Referent::Frame(frame) => write!(f, "{:04X}", frame)?,
        }
        if self.displacement != 0 {
            write!(f, "+{:X}", self.displacement)?;
        }
        Ok(())
    }
}
