mod common;

use std::collections::BTreeMap;

use common::{at, code_image, code_image_with_fixups, run};
use scatha::analysis::engine::decode_at;
use scatha::core::address::{Address, Referent, SymbolicTarget};
use scatha::core::basic_block::BlockTermination;
use scatha::core::fixup::{Fixup, FixupKind, FixupMode};
use scatha::core::segment::ByteKind;
use scatha::image::{Image, LibraryImage};
use scatha::{analyze, AnalysisConfig, IcedDecoder, Session};

/// A small function with a loop, a forward branch, a call and a jump table.
fn sample() -> Vec<u8> {
    vec![
        0x55, // 00 push bp
        0x8B, 0xEC, // 01 mov bp,sp
        0x31, 0xC9, // 03 xor cx,cx
        0x41, // 05 inc cx
        0x83, 0xF9, 0x0A, // 06 cmp cx,10
        0x75, 0xFA, // 09 jne 05
        0xE8, 0x07, 0x00, // 0B call 15
        0x74, 0x02, // 0E je 12
        0xEB, 0x00, // 10 jmp 12
        0x5D, // 12 pop bp
        0xC3, // 13 ret
        0x90, // 14 nop
        0x2E, 0xFF, 0xA7, 0x1A, 0x00, // 15 jmp cs:[bx+001A]
        0x1E, 0x00, // 1A dw 001E
        0x1F, 0x00, // 1C dw 001F
        0xC3, // 1E ret
        0xC3, // 1F ret
    ]
}

fn kinds(image: &LibraryImage) -> Vec<ByteKind> {
    let segment = image.segment(0).unwrap();
    (0..segment.len()).filter_map(|i| segment.kind(i)).collect()
}

#[test]
fn test_blocks_never_overlap() {
    let mut image = code_image(&sample());
    let session = run(&mut image, &[at(0), at(0x0E), at(0x13)]);
    assert!(session.errors().is_empty(), "{:?}", session.errors().sorted());

    let mut covered = BTreeMap::new();
    for (id, block) in session.block_store().iter() {
        for index in block.byte_range() {
            assert!(covered.insert(index, id).is_none(), "byte {index:#x} in two blocks");
        }
    }
    // owners agree with the block store
    let segment = image.segment(0).unwrap();
    for (index, id) in covered {
        let attribute = segment.attribute(index).unwrap();
        assert_eq!(attribute.kind(), ByteKind::Code);
        assert_eq!(attribute.block(), Some(id));
    }
}

#[test]
fn test_lead_bytes_are_block_or_instruction_starts() {
    let mut image = code_image(&sample());
    let session = run(&mut image, &[at(0)]);
    let decoder = IcedDecoder::new();
    for block in session.blocks() {
        let mut offset = block.start.offset;
        let end = block.end_offset();
        while u32::from(offset) < end {
            let attribute = image.byte_attribute(Address::new(0, offset)).unwrap();
            assert!(attribute.is_lead_byte());
            let decoded = decode_at(&image, &decoder, Address::new(0, offset)).unwrap();
            offset += u16::from(decoded.instruction.length);
        }
        assert_eq!(u32::from(offset), end);
    }
}

#[test]
fn test_marking_is_monotonic() {
    let mut image = code_image(&sample());
    let mut session = Session::new();
    let decoder = IcedDecoder::new();
    let config = AnalysisConfig::default();

    analyze(&mut image, &decoder, &mut session, &[at(0x15)], &config);
    let before = kinds(&image);
    analyze(&mut image, &decoder, &mut session, &[at(0)], &config);
    let after = kinds(&image);

    for (index, (old, new)) in before.iter().zip(&after).enumerate() {
        if *old != ByteKind::Unknown {
            assert_eq!(old, new, "byte {index:#x} changed from {old:?}");
        }
    }
    assert!(after.iter().filter(|k| **k != ByteKind::Unknown).count()
        > before.iter().filter(|k| **k != ByteKind::Unknown).count());
}

#[test]
fn test_split_preserves_coverage() {
    let code = sample();
    let mut whole = code_image(&code);
    let one_pass = run(&mut whole, &[at(0)]);

    // entering at 0x03 later splits the first block
    let mut image = code_image(&code);
    let mut session = Session::new();
    let decoder = IcedDecoder::new();
    let config = AnalysisConfig::default();
    analyze(&mut image, &decoder, &mut session, &[at(0)], &config);
    analyze(&mut image, &decoder, &mut session, &[at(0x03)], &config);

    assert_eq!(kinds(&image), kinds(&whole));
    assert_eq!(session.blocks().count(), one_pass.blocks().count() + 1);
    let head = session.block_at(&image, Address::new(0, 0)).unwrap();
    assert_eq!(head.length, 3);
    assert_eq!(head.termination, BlockTermination::FallThrough);
    let tail = session.block_at(&image, Address::new(0, 3)).unwrap();
    assert_eq!(tail.start, Address::new(0, 3));
    assert_eq!(tail.end_offset(), 5);

    let total: usize = session.blocks().map(|b| b.length).sum();
    let expected: usize = one_pass.blocks().map(|b| b.length).sum();
    assert_eq!(total, expected);
}

#[test]
fn test_analysis_terminates_on_self_loop() {
    // jmp $ ; loop $ ; ret
    let mut image = code_image(&[0xEB, 0xFE, 0xE2, 0xFE, 0xC3]);
    let session = run(&mut image, &[at(0), at(2)]);
    assert_eq!(session.blocks().count(), 3);
    assert!(session.errors().is_empty());
}

#[test]
fn test_fixup_alignment_is_idempotent() {
    // call far 0000:0000 with a pointer fixup, then retf
    let fixup = Fixup::new(
        1,
        FixupKind::Pointer,
        FixupMode::SegmentRelative,
        SymbolicTarget::new(Referent::Segment(0), 5),
    );
    let mut image = code_image_with_fixups(&[0x9A, 0, 0, 0, 0, 0xCB], vec![fixup]);
    let decoder = IcedDecoder::new();
    let first = decode_at(&image, &decoder, Address::new(0, 0)).unwrap();
    let second = decode_at(&image, &decoder, Address::new(0, 0)).unwrap();
    assert!(first.is_clean());
    assert_eq!(first.instruction.operands, second.instruction.operands);
    assert_eq!(first.broken, second.broken);

    let session = run(&mut image, &[at(0)]);
    // decoding again after analysis gives the same tags
    let third = decode_at(&image, &decoder, Address::new(0, 0)).unwrap();
    assert_eq!(first.instruction.operands, third.instruction.operands);
    let calls = session.xrefs_from(Address::new(0, 0));
    assert_eq!(calls[0].target, Some(Address::new(0, 5)));
}

#[test]
fn test_shared_worklist_across_entries() {
    let code = sample();
    let mut together = code_image(&code);
    let joint = run(&mut together, &[at(0), at(0x15)]);

    let mut separate = code_image(&code);
    let mut session = Session::new();
    let decoder = IcedDecoder::new();
    let config = AnalysisConfig::default();
    analyze(&mut separate, &decoder, &mut session, &[at(0x15)], &config);
    analyze(&mut separate, &decoder, &mut session, &[at(0)], &config);

    assert_eq!(kinds(&together), kinds(&separate));
    assert_eq!(joint.blocks().count(), session.blocks().count());
    assert_eq!(joint.procedures().len(), session.procedures().len());
}
