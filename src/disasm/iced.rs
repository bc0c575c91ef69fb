use iced_x86::{ConstantOffsets, DecoderError, DecoderOptions, OpCodeOperandKind, OpKind};
use std::ops::Range;

use crate::core::instruction::{Instruction, Operand, OperandKind};
use crate::disasm::{DecodeError, DecodeResult, Decoder};

/// 16-bit real-mode decoder backed by iced-x86.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcedDecoder;

impl IcedDecoder {
    pub fn new() -> Self {
        Self
    }

    fn span(offset: usize, size: usize) -> Option<Range<u8>> {
        if size == 0 {
            None
        } else {
            Some(offset as u8..(offset + size) as u8)
        }
    }

    /// Bytes holding a relative branch displacement.
    fn branch_span(instr: &iced_x86::Instruction, co: &ConstantOffsets) -> Option<Range<u8>> {
        if co.has_immediate() {
            return Self::span(co.immediate_offset(), co.immediate_size());
        }
        // The displacement always ends the encoding.
        let short = instr.op_code().op_kinds().iter().any(|kind| {
            matches!(
                kind,
                OpCodeOperandKind::br16_1 | OpCodeOperandKind::br32_1
            )
        });
        let size = if short { 1 } else { 2 };
        Self::span(instr.len() - size, size)
    }

    /// Bytes holding a `ptr16:16` operand, offset word then selector word.
    fn pointer_span(instr: &iced_x86::Instruction, co: &ConstantOffsets) -> Option<Range<u8>> {
        if co.has_immediate() && co.has_immediate2() {
            let end = co.immediate_offset2() + co.immediate_size2();
            return Self::span(co.immediate_offset(), end - co.immediate_offset());
        }
        Self::span(instr.len() - 4, 4)
    }

    fn iced_operands(instr: &iced_x86::Instruction, co: &ConstantOffsets) -> Vec<Operand> {
        let mut out = Vec::new();
        let next_ip = instr.next_ip() as u16;
        for i in 0..instr.op_count() {
            let operand = match instr.op_kind(i) {
                OpKind::Register => {
                    Operand::new(OperandKind::Register(instr.op_register(i)), None)
                }
                OpKind::NearBranch16 => {
                    let displacement = instr.near_branch16().wrapping_sub(next_ip) as i16;
                    Operand::new(
                        OperandKind::NearBranch { displacement },
                        Self::branch_span(instr, co),
                    )
                }
                OpKind::FarBranch16 => Operand::new(
                    OperandKind::FarBranch {
                        selector: instr.far_branch_selector(),
                        offset: instr.far_branch16(),
                    },
                    Self::pointer_span(instr, co),
                ),
                OpKind::Immediate8 => Operand::new(
                    OperandKind::Immediate(u16::from(instr.immediate8())),
                    Self::span(co.immediate_offset(), co.immediate_size()),
                ),
                OpKind::Immediate8to16 => Operand::new(
                    OperandKind::Immediate(instr.immediate8to16() as u16),
                    Self::span(co.immediate_offset(), co.immediate_size()),
                ),
                OpKind::Immediate16 => Operand::new(
                    OperandKind::Immediate(instr.immediate16()),
                    Self::span(co.immediate_offset(), co.immediate_size()),
                ),
                OpKind::Immediate8_2nd => Operand::new(
                    OperandKind::Immediate(u16::from(instr.immediate8_2nd())),
                    Self::span(co.immediate_offset2(), co.immediate_size2()),
                ),
                OpKind::Memory => Operand::new(
                    OperandKind::Memory {
                        segment_prefix: instr.segment_prefix(),
                        base: instr.memory_base(),
                        index: instr.memory_index(),
                        displacement: instr.memory_displacement64() as u16,
                    },
                    if co.has_displacement() {
                        Self::span(co.displacement_offset(), co.displacement_size())
                    } else {
                        None
                    },
                ),
                _ => Operand::new(OperandKind::Implicit, None),
            };
            out.push(operand);
        }
        out
    }
}

impl Decoder for IcedDecoder {
    fn decode(&self, bytes: &[u8], ip: u16) -> DecodeResult<Instruction> {
        let window = &bytes[..bytes.len().min(self.max_instruction_length())];
        let mut decoder = iced_x86::Decoder::with_ip(16, window, u64::from(ip), DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(match decoder.last_error() {
                DecoderError::NoMoreBytes => DecodeError::InsufficientBytes,
                _ => DecodeError::InvalidInstruction,
            });
        }
        let co = decoder.get_constant_offsets(&instr);
        let operands = Self::iced_operands(&instr, &co);
        Ok(Instruction::new(instr, operands))
    }

    fn max_instruction_length(&self) -> usize {
        15
    }

    fn name(&self) -> &str {
        "iced-x86"
    }
}
