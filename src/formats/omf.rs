//! OMF object module and library loader.
//!
//! Accepts a page-aligned library (`F0` header, modules, `F1` end) or one or
//! more plain object modules, and builds a [`LibraryImage`]. Only the records
//! that carry code, data, names and fixups are interpreted; debug and
//! comment records are skipped.
//!
//! Record layout: type byte, 16-bit length (covering body and checksum),
//! body, checksum. Odd record types are the 32-bit variants whose offset
//! and length fields are four bytes wide.

use std::collections::HashMap;

use crate::core::address::{Address, Referent, SymbolicTarget};
use crate::core::fixup::{Fixup, FixupKind, FixupMode, FixupTable};
use crate::core::segment::Segment;
use crate::error::{Result, ScathaError};
use crate::formats::utils::ReadExt;
use crate::image::{Image, LibraryImage};

pub const THEADR: u8 = 0x80;
pub const LHEADR: u8 = 0x82;
pub const COMENT: u8 = 0x88;
pub const MODEND: u8 = 0x8A;
pub const EXTDEF: u8 = 0x8C;
pub const TYPDEF: u8 = 0x8E;
pub const PUBDEF: u8 = 0x90;
pub const LINNUM: u8 = 0x94;
pub const LNAMES: u8 = 0x96;
pub const SEGDEF: u8 = 0x98;
pub const GRPDEF: u8 = 0x9A;
pub const FIXUPP: u8 = 0x9C;
pub const LEDATA: u8 = 0xA0;
pub const LIDATA: u8 = 0xA2;
pub const COMDEF: u8 = 0xB0;
pub const LEXTDEF: u8 = 0xB4;
pub const LPUBDEF: u8 = 0xB6;
pub const LCOMDEF: u8 = 0xB8;
pub const LINSYM: u8 = 0xC4;
pub const ALIAS: u8 = 0xC6;
pub const LLNAMES: u8 = 0xCA;
pub const VERNUM: u8 = 0xCC;
pub const VENDEXT: u8 = 0xCE;
pub const LIBHDR: u8 = 0xF0;
pub const LIBEND: u8 = 0xF1;

/// One raw record.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    /// Record type with the 32-bit bit cleared
    pub kind: u8,
    /// 32-bit variant
    pub wide: bool,
    /// File offset of the type byte
    pub offset: usize,
    /// Contents without the checksum byte
    pub body: &'a [u8],
}

impl<'a> Record<'a> {
    /// Read the record starting at `offset`.
    pub fn read(data: &'a [u8], offset: usize) -> Result<Self> {
        let raw = data.read_u8_at(offset).ok_or(ScathaError::TruncatedHeader {
            offset,
            expected: 3,
            actual: 0,
        })?;
        let length = data
            .read_u16_le_at(offset + 1)
            .ok_or(ScathaError::TruncatedHeader {
                offset,
                expected: 3,
                actual: data.len() - offset,
            })? as usize;
        if length == 0 {
            return Err(malformed(raw, offset, "zero record length"));
        }
        let body = data
            .read_slice_at(offset + 3, length - 1)
            .ok_or(ScathaError::TruncatedHeader {
                offset: offset + 3,
                expected: length,
                actual: data.len().saturating_sub(offset + 3),
            })?;
        // Library header and end records are even but have no 32-bit twin.
        let wide = raw & 1 == 1 && raw < LIBHDR;
        Ok(Self {
            kind: if wide { raw & !1 } else { raw },
            wide,
            offset,
            body,
        })
    }

    /// Offset of the next record.
    pub fn end(&self) -> usize {
        self.offset + 3 + self.body.len() + 1
    }

    fn cursor(&self) -> Cursor<'a> {
        Cursor {
            record: *self,
            pos: 0,
        }
    }
}

fn malformed(record: u8, offset: usize, message: impl Into<String>) -> ScathaError {
    ScathaError::MalformedRecord {
        record,
        offset,
        message: message.into(),
    }
}

/// Field reader over a record body.
struct Cursor<'a> {
    record: Record<'a>,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn offset(&self) -> usize {
        self.record.offset + 3 + self.pos
    }

    fn error(&self, message: &str) -> ScathaError {
        malformed(self.record.kind, self.offset(), message)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.record.body.len()
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let body: &'a [u8] = self.record.body;
        let out = body
            .read_slice_at(self.pos, len)
            .ok_or_else(|| self.error("record too short"))?;
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Offset or length field: 16 bits, 32 in wide records.
    fn word(&mut self) -> Result<u32> {
        if self.record.wide {
            self.u32()
        } else {
            self.u16().map(u32::from)
        }
    }

    /// One or two byte index.
    fn index(&mut self) -> Result<u16> {
        let first = self.u8()?;
        if first & 0x80 == 0 {
            Ok(u16::from(first))
        } else {
            Ok((u16::from(first & 0x7F) << 8) | u16::from(self.u8()?))
        }
    }

    fn name(&mut self) -> Result<String> {
        let len = usize::from(self.u8()?);
        Ok(String::from_utf8_lossy(self.bytes(len)?).into_owned())
    }

    /// COMDEF length: short form up to 0x80, else a width marker.
    fn common_length(&mut self) -> Result<u32> {
        match self.u8()? {
            b @ 0..=0x80 => Ok(u32::from(b)),
            0x81 => self.u16().map(u32::from),
            0x84 => {
                let b = self.bytes(3)?;
                Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
            }
            0x88 => self.u32(),
            _ => Err(self.error("bad common length marker")),
        }
    }
}

struct SegmentDef {
    name: String,
    class: String,
    data: Vec<u8>,
    fixups: Vec<Fixup>,
}

/// State for the module currently being read.
struct ModuleBuilder {
    module: usize,
    /// Global index of this module's first segment
    segment_base: usize,
    group_base: usize,
    names: Vec<String>,
    segments: Vec<SegmentDef>,
    groups: Vec<(String, Vec<usize>)>,
    externals: Vec<u32>,
    target_threads: [Option<Referent>; 4],
    /// Segment and offset of the last LEDATA/LIDATA
    last_data: Option<(usize, usize)>,
    /// Whether the last data record was LIDATA
    last_iterated: bool,
}

impl ModuleBuilder {
    fn new(image: &mut LibraryImage, name: String) -> Self {
        let group_base = image.groups().len();
        let segment_base = image.segment_count();
        Self {
            module: image.add_module(name),
            segment_base,
            group_base,
            names: Vec::new(),
            segments: Vec::new(),
            groups: Vec::new(),
            externals: Vec::new(),
            target_threads: [None; 4],
            last_data: None,
            last_iterated: false,
        }
    }

    fn lookup_name(&self, index: u16, cur: &Cursor) -> Result<String> {
        match index {
            0 => Ok(String::new()),
            i => self
                .names
                .get(usize::from(i) - 1)
                .cloned()
                .ok_or_else(|| cur.error("name index out of range")),
        }
    }

    /// Local 1-based segment index to a local 0-based one.
    fn local_segment(&self, index: u16) -> Result<usize> {
        let i = usize::from(index);
        if i == 0 || i > self.segments.len() {
            return Err(ScathaError::InvalidIndex {
                table: "segment",
                index: i,
            });
        }
        Ok(i - 1)
    }

    fn global_segment(&self, index: u16) -> Result<u16> {
        Ok((self.segment_base + self.local_segment(index)?) as u16)
    }

    fn referent(&self, method: u8, datum: u16) -> Result<Referent> {
        let i = usize::from(datum);
        match method & 3 {
            0 => Ok(Referent::Segment(self.global_segment(datum)?)),
            1 => {
                if i == 0 || i > self.groups.len() {
                    return Err(ScathaError::InvalidIndex { table: "group", index: i });
                }
                Ok(Referent::Group((self.group_base + i - 1) as u16))
            }
            2 => self
                .externals
                .get(i.wrapping_sub(1))
                .map(|&e| Referent::External(e))
                .ok_or(ScathaError::InvalidIndex {
                    table: "external",
                    index: i,
                }),
            _ => Ok(Referent::Frame(datum)),
        }
    }

    fn lnames(&mut self, record: &Record) -> Result<()> {
        let mut cur = record.cursor();
        while !cur.is_empty() {
            self.names.push(cur.name()?);
        }
        Ok(())
    }

    fn segdef(&mut self, record: &Record) -> Result<()> {
        let mut cur = record.cursor();
        let acbp = cur.u8()?;
        if acbp >> 5 == 0 {
            // absolute segment: frame number and offset
            cur.u16()?;
            cur.u8()?;
        }
        let mut length = cur.word()? as usize;
        if acbp & 0x02 != 0 {
            if record.wide {
                return Err(cur.error("4 GB segment"));
            }
            length = 0x10000;
        }
        if length > 0x10000 {
            return Err(cur.error("segment larger than 64K"));
        }
        let name = self.lookup_name(cur.index()?, &cur)?;
        let class = self.lookup_name(cur.index()?, &cur)?;
        cur.index()?;
        self.segments.push(SegmentDef {
            name,
            class,
            data: vec![0; length],
            fixups: Vec::new(),
        });
        Ok(())
    }

    fn grpdef(&mut self, record: &Record) -> Result<()> {
        let mut cur = record.cursor();
        let name = self.lookup_name(cur.index()?, &cur)?;
        let mut members = Vec::new();
        while !cur.is_empty() {
            if cur.u8()? != 0xFF {
                return Err(cur.error("unsupported group component"));
            }
            members.push(self.segment_base + self.local_segment(cur.index()?)?);
        }
        self.groups.push((name, members));
        Ok(())
    }

    fn extdef(&mut self, image: &mut LibraryImage, record: &Record, local: bool) -> Result<()> {
        let mut cur = record.cursor();
        while !cur.is_empty() {
            let name = cur.name()?;
            cur.index()?;
            self.externals.push(image.add_external(self.module, name, local)?);
        }
        Ok(())
    }

    fn comdef(&mut self, image: &mut LibraryImage, record: &Record, local: bool) -> Result<()> {
        let mut cur = record.cursor();
        while !cur.is_empty() {
            let name = cur.name()?;
            cur.index()?;
            match cur.u8()? {
                // FAR: element count and element size
                0x61 => {
                    cur.common_length()?;
                    cur.common_length()?;
                }
                _ => {
                    cur.common_length()?;
                }
            }
            self.externals.push(image.add_external(self.module, name, local)?);
        }
        Ok(())
    }

    fn pubdef(&mut self, image: &mut LibraryImage, record: &Record, local: bool) -> Result<()> {
        let mut cur = record.cursor();
        cur.index()?;
        let segment = cur.index()?;
        if segment == 0 {
            let frame = cur.u16()?;
            tracing::debug!(module = self.module, frame, "skipping absolute public symbols");
            return Ok(());
        }
        let segment = self.global_segment(segment)?;
        while !cur.is_empty() {
            let name = cur.name()?;
            let offset = cur.word()?;
            cur.index()?;
            let offset = u16::try_from(offset).map_err(|_| cur.error("public offset beyond 64K"))?;
            image.add_symbol(self.module, name, Address::new(segment, offset), local);
        }
        Ok(())
    }

    fn store(&mut self, segment: usize, offset: usize, bytes: &[u8], cur: &Cursor) -> Result<()> {
        let data = &mut self.segments[segment].data;
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| cur.error("data beyond segment length"))?;
        data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fn ledata(&mut self, record: &Record) -> Result<()> {
        let mut cur = record.cursor();
        let segment = self.local_segment(cur.index()?)?;
        let offset = cur.word()? as usize;
        let bytes = cur.bytes(record.body.len() - cur.pos)?;
        self.store(segment, offset, bytes, &cur)?;
        self.last_data = Some((segment, offset));
        self.last_iterated = false;
        Ok(())
    }

    fn lidata(&mut self, record: &Record) -> Result<()> {
        let mut cur = record.cursor();
        let segment = self.local_segment(cur.index()?)?;
        let offset = cur.word()? as usize;
        let limit = self.segments[segment].data.len().saturating_sub(offset);
        let mut bytes = Vec::new();
        while !cur.is_empty() {
            expand_iterated(&mut cur, &mut bytes, limit)?;
        }
        self.store(segment, offset, &bytes, &cur)?;
        self.last_data = Some((segment, offset));
        self.last_iterated = true;
        Ok(())
    }

    fn fixupp(&mut self, record: &Record) -> Result<()> {
        let mut cur = record.cursor();
        while !cur.is_empty() {
            let first = cur.u8()?;
            if first & 0x80 == 0 {
                self.thread(&mut cur, first)?;
            } else {
                self.fixup(&mut cur, first)?;
            }
        }
        Ok(())
    }

    fn thread(&mut self, cur: &mut Cursor, first: u8) -> Result<()> {
        let method = (first >> 2) & 0x07;
        let slot = usize::from(first & 0x03);
        if first & 0x40 != 0 {
            // frame thread, parsed and discarded
            match method {
                0..=2 => {
                    cur.index()?;
                }
                3 => {
                    cur.u16()?;
                }
                _ => {}
            }
        } else {
            let datum = if method & 3 == 3 { cur.u16()? } else { cur.index()? };
            self.target_threads[slot] = Some(self.referent(method, datum)?);
        }
        Ok(())
    }

    fn fixup(&mut self, cur: &mut Cursor, first: u8) -> Result<()> {
        let at = cur.offset() - 1;
        let second = cur.u8()?;
        let mode = if first & 0x40 != 0 {
            FixupMode::SegmentRelative
        } else {
            FixupMode::SelfRelative
        };
        let location = (first >> 2) & 0x0F;
        let kind = match location {
            0 => FixupKind::LowByte,
            1 | 5 => FixupKind::Offset,
            2 => FixupKind::Base,
            3 => FixupKind::Pointer,
            other => {
                return Err(ScathaError::UnsupportedFixup {
                    location: other,
                    offset: at,
                })
            }
        };
        let data_offset = (usize::from(first & 0x03) << 8) | usize::from(second);

        let fixdat = cur.u8()?;
        if fixdat & 0x80 == 0 {
            match (fixdat >> 4) & 0x07 {
                0..=2 => {
                    cur.index()?;
                }
                3 => {
                    cur.u16()?;
                }
                _ => {}
            }
        }
        let referent = if fixdat & 0x08 != 0 {
            self.target_threads[usize::from(fixdat & 0x03)]
                .ok_or_else(|| cur.error("undefined target thread"))?
        } else {
            let method = fixdat & 0x03;
            let datum = if method == 3 { cur.u16()? } else { cur.index()? };
            self.referent(method, datum)?
        };
        let mut displacement = if fixdat & 0x04 == 0 {
            cur.word()? as u16
        } else {
            0
        };

        let (segment, base) = self
            .last_data
            .ok_or_else(|| cur.error("fixup without preceding data record"))?;
        // offsets would index the iterated body, not the expanded bytes
        if self.last_iterated {
            return Err(cur.error("fixups on LIDATA are not supported"));
        }
        let start = base + data_offset;
        let data = &self.segments[segment].data;
        if start + kind.width() > data.len() {
            return Err(cur.error("fixup beyond segment length"));
        }
        if mode == FixupMode::SegmentRelative {
            let addend = match kind {
                FixupKind::LowByte => data.read_u8_at(start).map(u16::from),
                FixupKind::Offset | FixupKind::Pointer => data.read_u16_le_at(start),
                FixupKind::Base => Some(0),
            };
            displacement = displacement.wrapping_add(addend.unwrap_or_default());
        }
        self.segments[segment].fixups.push(Fixup::new(
            start,
            kind,
            mode,
            SymbolicTarget::new(referent, displacement),
        ));
        Ok(())
    }

    /// Move the finished module into the image.
    fn finish(self, image: &mut LibraryImage) -> Result<()> {
        for def in self.segments {
            let fixups = FixupTable::new(def.fixups)?;
            let mut segment = Segment::new(def.name, def.data).with_fixups(fixups);
            if !def.class.is_empty() {
                segment = segment.with_class(def.class);
            }
            image.add_segment(self.module, segment)?;
        }
        for (name, members) in self.groups {
            image.add_group(self.module, name, members)?;
        }
        Ok(())
    }
}

/// Expand one LIDATA data block into `out`, never beyond `limit` bytes.
fn expand_iterated(cur: &mut Cursor, out: &mut Vec<u8>, limit: usize) -> Result<()> {
    let repeat = cur.word()? as usize;
    let blocks = cur.u16()?;
    let mut content = Vec::new();
    if blocks == 0 {
        let len = usize::from(cur.u8()?);
        content.extend_from_slice(cur.bytes(len)?);
    } else {
        for _ in 0..blocks {
            expand_iterated(cur, &mut content, limit)?;
        }
    }
    for _ in 0..repeat {
        if out.len() + content.len() > limit {
            return Err(cur.error("iterated data beyond segment length"));
        }
        out.extend_from_slice(&content);
    }
    Ok(())
}

/// Load an OMF library or object file.
pub fn load(data: &[u8]) -> Result<LibraryImage> {
    let mut image = LibraryImage::new();
    let mut pos = 0;
    let mut page_size = None;
    let mut module: Option<ModuleBuilder> = None;
    let mut names_seen: HashMap<String, usize> = HashMap::new();

    while pos < data.len() {
        if module.is_none() && data[pos..].iter().all(|&b| b == 0) {
            break;
        }
        let record = Record::read(data, pos)?;
        pos = record.end();
        match record.kind {
            LIBHDR if record.offset == 0 => page_size = Some(record.body.len() + 4),
            LIBEND => break,
            THEADR | LHEADR => {
                if module.is_some() {
                    return Err(malformed(record.kind, record.offset, "module header before MODEND"));
                }
                let mut name = record.cursor().name()?;
                let seen = names_seen.entry(name.clone()).or_insert(0);
                *seen += 1;
                if *seen > 1 {
                    name = format!("{}#{}", name, seen);
                }
                module = Some(ModuleBuilder::new(&mut image, name));
            }
            kind => {
                let Some(builder) = module.as_mut() else {
                    return Err(malformed(kind, record.offset, "record outside a module"));
                };
                match kind {
                    MODEND => {
                        if let Some(builder) = module.take() {
                            builder.finish(&mut image)?;
                        }
                        if let Some(page) = page_size {
                            pos = pos.div_ceil(page) * page;
                        }
                    }
                    LNAMES | LLNAMES => builder.lnames(&record)?,
                    SEGDEF => builder.segdef(&record)?,
                    GRPDEF => builder.grpdef(&record)?,
                    EXTDEF => builder.extdef(&mut image, &record, false)?,
                    LEXTDEF => builder.extdef(&mut image, &record, true)?,
                    COMDEF => builder.comdef(&mut image, &record, false)?,
                    LCOMDEF => builder.comdef(&mut image, &record, true)?,
                    PUBDEF => builder.pubdef(&mut image, &record, false)?,
                    LPUBDEF => builder.pubdef(&mut image, &record, true)?,
                    LEDATA => builder.ledata(&record)?,
                    LIDATA => builder.lidata(&record)?,
                    FIXUPP => builder.fixupp(&record)?,
                    COMENT | TYPDEF | LINNUM | LINSYM | ALIAS | VERNUM | VENDEXT => {
                        tracing::trace!(record = kind, offset = record.offset, "skipped record");
                    }
                    other => {
                        return Err(ScathaError::UnsupportedRecord {
                            record: other,
                            offset: record.offset,
                        })
                    }
                }
            }
        }
    }

    if module.is_some() {
        return Err(malformed(MODEND, data.len(), "missing MODEND"));
    }
    tracing::info!(
        modules = image.modules().len(),
        segments = image.segment_count(),
        externals = image.externals().len(),
        "loaded OMF image"
    );
    Ok(image)
}
