//! Binary format loaders.
//!
//! Supported formats:
//! - MZ: DOS executables, loaded as a flat single-segment image
//! - OMF: object modules and page-aligned libraries, loaded as a
//!   multi-segment image with fixups and symbols

pub mod mz;
pub mod omf;
pub mod utils;

use std::path::Path;

use crate::analysis::EntryPoint;
use crate::core::address::Address;
use crate::error::{Result, ScathaError};
use crate::image::{ExecutableImage, Image, LibraryImage};

/// Detected input format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Mz,
    Omf,
}

impl Format {
    /// Sniff the format from the first bytes of a file.
    pub fn detect(data: &[u8]) -> Option<Self> {
        match data {
            [b'M', b'Z', ..] | [b'Z', b'M', ..] => Some(Format::Mz),
            [omf::THEADR | omf::LHEADR | omf::LIBHDR, ..] => Some(Format::Omf),
            _ => None,
        }
    }
}

/// An image produced by one of the loaders.
#[derive(Debug, Clone)]
pub enum LoadedImage {
    Executable(ExecutableImage),
    Library(LibraryImage),
}

impl LoadedImage {
    pub fn image(&self) -> &dyn Image {
        match self {
            LoadedImage::Executable(image) => image,
            LoadedImage::Library(image) => image,
        }
    }

    pub fn image_mut(&mut self) -> &mut dyn Image {
        match self {
            LoadedImage::Executable(image) => image,
            LoadedImage::Library(image) => image,
        }
    }

    /// Entry points to analyze when the caller names none: `CS:IP` for an
    /// executable, every public symbol in a code-class segment for a library.
    pub fn default_entry_points(&self) -> Vec<EntryPoint> {
        match self {
            LoadedImage::Executable(image) => vec![EntryPoint::user(image.entry())],
            LoadedImage::Library(image) => image
                .all_symbols()
                .iter()
                .filter(|s| !s.local)
                .filter(|s| {
                    image
                        .segment(usize::from(s.address.segment))
                        .is_some_and(|seg| seg.is_code_class())
                })
                .map(|s| EntryPoint::user(s.address))
                .collect(),
        }
    }
}

/// Load an image from memory, sniffing its format.
pub fn load(data: &[u8]) -> Result<LoadedImage> {
    match Format::detect(data) {
        Some(Format::Mz) => mz::load(data).map(LoadedImage::Executable),
        Some(Format::Omf) => omf::load(data).map(LoadedImage::Library),
        None => Err(ScathaError::InvalidSignature(format!(
            "unrecognized format ({} bytes)",
            data.len()
        ))),
    }
}

/// Read and load a file.
pub fn open(path: impl AsRef<Path>) -> Result<LoadedImage> {
    let path = path.as_ref();
    let data = std::fs::read(path)?;
    tracing::debug!(path = %path.display(), bytes = data.len(), "opening image");
    load(&data)
}

/// Parse a `SSSS:OOOO` hexadecimal address.
pub fn parse_address(text: &str) -> Option<Address> {
    let (segment, offset) = text.split_once(':')?;
    Some(Address::new(
        u16::from_str_radix(segment.trim(), 16).ok()?,
        u16::from_str_radix(offset.trim(), 16).ok()?,
    ))
}
