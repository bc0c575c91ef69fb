//! Binary images the analysis engine runs over.
//!
//! The engine only talks to the [`Image`] trait. Two implementations exist:
//! a flat single-segment MZ executable and a multi-segment OMF library whose
//! segments carry fixups and whose externals resolve through a name table.

pub mod executable;
pub mod library;

pub use executable::ExecutableImage;
pub use library::LibraryImage;

use crate::core::address::{Address, Location, Referent, SymbolicTarget};
use crate::core::segment::{ByteAttribute, Segment};

/// Capabilities the analysis engine needs from an image.
pub trait Image {
    fn segment_count(&self) -> usize;

    fn segment(&self, index: usize) -> Option<&Segment>;

    fn segment_mut(&mut self, index: usize) -> Option<&mut Segment>;

    /// Byte slot of a logical address, or `None` when it is outside the image.
    fn locate(&self, address: Address) -> Option<Location>;

    fn is_address_valid(&self, address: Address) -> bool {
        self.locate(address).is_some()
    }

    /// Logical address of `location`, expressed relative to `anchor`'s segment.
    fn address_at(&self, anchor: Address, location: Location) -> Option<Address>;

    /// Resolve a symbolic target; `None` when the referent is unknown.
    fn resolve(&self, target: &SymbolicTarget) -> Option<Address>;

    /// Inferred ordinal of the segment `address` falls in.
    fn segment_ordinal(&self, address: Address) -> Option<usize>;

    fn format_address(&self, address: Address) -> String;

    /// Printable name of a referent (symbol, segment or group name).
    fn referent_name(&self, referent: Referent) -> Option<String>;

    /// Public symbols with their addresses.
    fn symbols(&self) -> Vec<(Address, String)>;

    fn byte_attribute(&self, address: Address) -> Option<ByteAttribute> {
        let location = self.locate(address)?;
        self.segment(location.segment)?.attribute(location.index)
    }
}
