//! MZ (DOS) executable loader.
//!
//! Reads the 28-byte header, the relocation table and the load module, and
//! produces an [`ExecutableImage`]. The load module starts right after the
//! header paragraphs and ends where the page counts say the file ends.

use serde::{Deserialize, Serialize};

use crate::core::address::Address;
use crate::error::{Result, ScathaError};
use crate::formats::utils::{require, ReadExt};
use crate::image::ExecutableImage;

pub const HEADER_SIZE: usize = 28;
pub const BYTES_PER_PARAGRAPH: usize = 16;
pub const BYTES_PER_PAGE: usize = 512;

/// Fixed part of the MZ header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MzHeader {
    pub last_page_bytes: u16,
    pub pages: u16,
    pub relocation_count: u16,
    pub header_paragraphs: u16,
    pub min_alloc: u16,
    pub max_alloc: u16,
    pub initial_ss: u16,
    pub initial_sp: u16,
    pub checksum: u16,
    pub initial_ip: u16,
    pub initial_cs: u16,
    pub relocation_table_offset: u16,
    pub overlay: u16,
}

impl MzHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = require(data, 0, HEADER_SIZE)?;
        if &header[0..2] != b"MZ" && &header[0..2] != b"ZM" {
            return Err(ScathaError::InvalidSignature(format!(
                "expected MZ, found {:02X} {:02X}",
                header[0], header[1]
            )));
        }
        let word = |offset: usize| header.read_u16_le_at(offset).unwrap_or_default();
        Ok(Self {
            last_page_bytes: word(2),
            pages: word(4),
            relocation_count: word(6),
            header_paragraphs: word(8),
            min_alloc: word(10),
            max_alloc: word(12),
            initial_ss: word(14),
            initial_sp: word(16),
            checksum: word(18),
            initial_ip: word(20),
            initial_cs: word(22),
            relocation_table_offset: word(24),
            overlay: word(26),
        })
    }

    /// File size covered by the page counts.
    pub fn file_size(&self) -> usize {
        let pages = usize::from(self.pages) * BYTES_PER_PAGE;
        match self.last_page_bytes {
            0 => pages,
            last => pages.saturating_sub(BYTES_PER_PAGE - usize::from(last).min(BYTES_PER_PAGE)),
        }
    }

    pub fn header_size(&self) -> usize {
        usize::from(self.header_paragraphs) * BYTES_PER_PARAGRAPH
    }

    pub fn entry_point(&self) -> Address {
        Address::new(self.initial_cs, self.initial_ip)
    }
}

/// Relocation slots as `segment:offset` inside the load module.
pub fn relocations(data: &[u8], header: &MzHeader) -> Result<Vec<Address>> {
    let start = usize::from(header.relocation_table_offset);
    let table = require(data, start, usize::from(header.relocation_count) * 4)?;
    Ok(table
        .chunks_exact(4)
        .map(|entry| {
            let offset = entry.read_u16_le_at(0).unwrap_or_default();
            let segment = entry.read_u16_le_at(2).unwrap_or_default();
            Address::new(segment, offset)
        })
        .collect())
}

/// Parse an MZ file into an executable image.
pub fn load(data: &[u8]) -> Result<ExecutableImage> {
    let header = MzHeader::parse(data)?;
    if header.header_size() < HEADER_SIZE {
        return Err(ScathaError::MalformedRecord {
            record: 0,
            offset: 8,
            message: format!("header of {} paragraphs", header.header_paragraphs),
        });
    }
    let relocations = relocations(data, &header)?;
    let end = header.file_size();
    if end < header.header_size() {
        return Err(ScathaError::MalformedRecord {
            record: 0,
            offset: 2,
            message: format!("file size {:#x} smaller than header", end),
        });
    }
    let module = require(data, header.header_size(), end - header.header_size())?;
    tracing::info!(
        load_module = module.len(),
        relocations = relocations.len(),
        entry = %header.entry_point(),
        "loaded MZ executable"
    );
    ExecutableImage::new(
        module.to_vec(),
        header.entry_point(),
        Address::new(header.initial_ss, header.initial_sp),
        relocations,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;

    /// Two-paragraph header, one relocation, `code` as the load module.
    fn build(code: &[u8], relocs: &[(u16, u16)]) -> Vec<u8> {
        let header_size = 32;
        let total = header_size + code.len();
        let mut out = vec![0u8; header_size];
        out[0..2].copy_from_slice(b"MZ");
        out[2..4].copy_from_slice(&((total % 512) as u16).to_le_bytes());
        out[4..6].copy_from_slice(&(total.div_ceil(512) as u16).to_le_bytes());
        out[6..8].copy_from_slice(&(relocs.len() as u16).to_le_bytes());
        out[8..10].copy_from_slice(&2u16.to_le_bytes());
        out[20..22].copy_from_slice(&0x0003u16.to_le_bytes());
        out[22..24].copy_from_slice(&0x0000u16.to_le_bytes());
        out[24..26].copy_from_slice(&0x001Cu16.to_le_bytes());
        for (i, (off, seg)) in relocs.iter().enumerate() {
            let at = 0x1C + i * 4;
            out[at..at + 2].copy_from_slice(&off.to_le_bytes());
            out[at + 2..at + 4].copy_from_slice(&seg.to_le_bytes());
        }
        out.extend_from_slice(code);
        out
    }

    #[test]
    fn test_load_minimal() {
        let code = [0x90, 0x90, 0x90, 0xB8, 0x01, 0x00, 0xC3];
        let image = load(&build(&code, &[(0x04, 0)])).unwrap();
        assert_eq!(image.entry(), Address::new(0, 3));
        assert_eq!(image.segment(0).unwrap().data(), &code);
        assert_eq!(image.relocations(), &[Address::new(0, 4)]);
        assert_eq!(image.segment(0).unwrap().fixups().len(), 1);
    }

    #[test]
    fn test_rejects_bad_signature() {
        let mut bytes = build(&[0xC3], &[]);
        bytes[0] = b'X';
        assert!(matches!(load(&bytes), Err(ScathaError::InvalidSignature(_))));
    }

    #[test]
    fn test_rejects_truncated() {
        let bytes = build(&[0xC3; 16], &[]);
        assert!(matches!(
            load(&bytes[..bytes.len() - 4]),
            Err(ScathaError::TruncatedHeader { .. })
        ));
        assert!(matches!(
            load(&bytes[..10]),
            Err(ScathaError::TruncatedHeader { .. })
        ));
    }

    #[test]
    fn test_file_size() {
        let mut header = MzHeader::parse(&build(&[], &[])).unwrap();
        header.pages = 3;
        header.last_page_bytes = 0;
        assert_eq!(header.file_size(), 1536);
        header.last_page_bytes = 0x10;
        assert_eq!(header.file_size(), 1024 + 0x10);
    }
}
