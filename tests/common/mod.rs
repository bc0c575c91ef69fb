//! Common test utilities and helpers.
//!
//! Byte builders for MZ files and OMF records, plus shortcuts for building
//! small in-memory images and running an analysis over them.

#![allow(dead_code)]

use scatha::core::address::Address;
use scatha::core::fixup::{Fixup, FixupTable};
use scatha::core::segment::Segment;
use scatha::image::{Image, LibraryImage};
use scatha::logging::{init_with, LogFormat};
use scatha::{analyze, AnalysisConfig, EntryPoint, IcedDecoder, Session};

/// MZ file with a two-paragraph header, entry `0000:ip` and `code` as the
/// load module. `relocations` are `(offset, segment)` slot addresses.
pub fn mz_file(code: &[u8], ip: u16, relocations: &[(u16, u16)]) -> Vec<u8> {
    let header_size = 32;
    assert!(0x1C + relocations.len() * 4 <= header_size);
    let total = header_size + code.len();
    let mut out = vec![0u8; header_size];
    out[0..2].copy_from_slice(b"MZ");
    out[2..4].copy_from_slice(&((total % 512) as u16).to_le_bytes());
    out[4..6].copy_from_slice(&(total.div_ceil(512) as u16).to_le_bytes());
    out[6..8].copy_from_slice(&(relocations.len() as u16).to_le_bytes());
    out[8..10].copy_from_slice(&2u16.to_le_bytes());
    out[20..22].copy_from_slice(&ip.to_le_bytes());
    out[24..26].copy_from_slice(&0x001Cu16.to_le_bytes());
    for (i, (offset, segment)) in relocations.iter().enumerate() {
        let at = 0x1C + i * 4;
        out[at..at + 2].copy_from_slice(&offset.to_le_bytes());
        out[at + 2..at + 4].copy_from_slice(&segment.to_le_bytes());
    }
    out.extend_from_slice(code);
    out
}

pub mod omf {
    pub const THEADR: u8 = 0x80;
    pub const EXTDEF: u8 = 0x8C;
    pub const PUBDEF: u8 = 0x90;
    pub const LNAMES: u8 = 0x96;
    pub const SEGDEF: u8 = 0x98;
    pub const FIXUPP: u8 = 0x9C;
    pub const LEDATA: u8 = 0xA0;
    pub const MODEND: u8 = 0x8A;
    pub const LIBHDR: u8 = 0xF0;
    pub const LIBEND: u8 = 0xF1;

    /// One record with a zero checksum.
    pub fn record(kind: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![kind];
        out.extend_from_slice(&((body.len() + 1) as u16).to_le_bytes());
        out.extend_from_slice(body);
        out.push(0);
        out
    }

    pub fn name(s: &str) -> Vec<u8> {
        let mut out = vec![s.len() as u8];
        out.extend_from_slice(s.as_bytes());
        out
    }

    /// Module with one `_TEXT` segment of class `CODE`.
    ///
    /// `publics` are `(name, offset)`; `externals` are declared in order and
    /// referenced from `fixupp` bodies by 1-based index.
    pub fn code_module(
        module: &str,
        code: &[u8],
        publics: &[(&str, u16)],
        externals: &[&str],
        fixupp: &[u8],
    ) -> Vec<u8> {
        let mut out = record(THEADR, &name(module));
        out.extend(record(LNAMES, &[name(""), name("_TEXT"), name("CODE")].concat()));
        let length = (code.len() as u16).to_le_bytes();
        // byte aligned, public; name 2, class 3, overlay 1
        out.extend(record(SEGDEF, &[0x28, length[0], length[1], 0x02, 0x03, 0x01]));
        if !externals.is_empty() {
            let body: Vec<u8> = externals.iter().flat_map(|e| [name(e), vec![0]].concat()).collect();
            out.extend(record(EXTDEF, &body));
        }
        for (public, offset) in publics {
            let body = [vec![0, 1], name(public), offset.to_le_bytes().to_vec(), vec![0]].concat();
            out.extend(record(PUBDEF, &body));
        }
        out.extend(record(LEDATA, &[&[0x01u8, 0x00, 0x00][..], code].concat()));
        if !fixupp.is_empty() {
            out.extend(record(FIXUPP, fixupp));
        }
        out.extend(record(MODEND, &[0x00]));
        out
    }

    /// Page-aligned library of `modules`.
    pub fn library(modules: &[Vec<u8>]) -> Vec<u8> {
        let page = 16;
        let mut out = record(LIBHDR, &vec![0; page - 4]);
        for module in modules {
            out.extend_from_slice(module);
            out.resize(out.len().div_ceil(page) * page, 0);
        }
        out.extend(record(LIBEND, &[0; 4]));
        out
    }
}

/// Single-module library image with one code segment.
pub fn code_image(code: &[u8]) -> LibraryImage {
    code_image_with_fixups(code, Vec::new())
}

pub fn code_image_with_fixups(code: &[u8], fixups: Vec<Fixup>) -> LibraryImage {
    let mut lib = LibraryImage::new();
    let module = lib.add_module("test");
    let segment = Segment::new("_TEXT", code.to_vec())
        .with_class("CODE")
        .with_fixups(FixupTable::new(fixups).expect("fixups do not overlap"));
    lib.add_segment(module, segment).expect("segment fits");
    lib
}

pub fn run(image: &mut dyn Image, entries: &[EntryPoint]) -> Session {
    run_with(image, entries, &AnalysisConfig::default())
}

pub fn run_with(image: &mut dyn Image, entries: &[EntryPoint], config: &AnalysisConfig) -> Session {
    init_with(LogFormat::Text, "warn");
    let mut session = Session::new();
    analyze(image, &IcedDecoder::new(), &mut session, entries, config);
    session
}

/// User entry at `0000:offset`.
pub fn at(offset: u16) -> EntryPoint {
    EntryPoint::user(Address::new(0, offset))
}
