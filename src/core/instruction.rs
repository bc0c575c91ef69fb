//! Decoded instruction model.
//!
//! The decoder fills in operands and their fixable byte spans. Fixup
//! alignment later tags operands with an [`OperandResolution`].

use iced_x86::{Code, Formatter, IntelFormatter, Mnemonic, Register};
use std::fmt;
use std::ops::Range;

use crate::core::address::{Address, SymbolicTarget};

/// What an operand's value is known to refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperandResolution {
    #[default]
    Unresolved,
    Concrete(Address),
    Symbolic(SymbolicTarget),
}

impl OperandResolution {
    pub fn symbolic(&self) -> Option<&SymbolicTarget> {
        match self {
            OperandResolution::Symbolic(target) => Some(target),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, OperandResolution::Unresolved)
    }
}

/// Structured operand kinds the analysis cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Register(Register),
    Immediate(u16),
    /// Relative branch; displacement is relative to the next instruction
    NearBranch { displacement: i16 },
    /// Absolute `ptr16:16`
    FarBranch { selector: u16, offset: u16 },
    Memory {
        segment_prefix: Register,
        base: Register,
        index: Register,
        displacement: u16,
    },
    /// String operands and other operands without encoded bytes
    Implicit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    /// Byte span inside the instruction that a fixup may patch
    pub fixable: Option<Range<u8>>,
    pub resolution: OperandResolution,
}

impl Operand {
    pub fn new(kind: OperandKind, fixable: Option<Range<u8>>) -> Self {
        Self {
            kind,
            fixable,
            resolution: OperandResolution::Unresolved,
        }
    }
}

/// One decoded 16-bit instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// Offset the instruction was decoded at
    pub ip: u16,
    /// Encoded length in bytes
    pub length: u8,
    pub mnemonic: Mnemonic,
    pub code: Code,
    /// Far control transfer (`JMP FAR`, `CALL FAR`)
    pub far: bool,
    pub operands: Vec<Operand>,
    raw: iced_x86::Instruction,
}

impl Instruction {
    pub fn new(raw: iced_x86::Instruction, operands: Vec<Operand>) -> Self {
        let code = raw.code();
        Self {
            ip: raw.ip16(),
            length: raw.len() as u8,
            mnemonic: raw.mnemonic(),
            code,
            far: matches!(
                code,
                Code::Jmp_ptr1616 | Code::Jmp_m1616 | Code::Call_ptr1616 | Code::Call_m1616
            ),
            operands,
            raw,
        }
    }

    /// Offset of the following instruction, which may be 0x10000.
    pub fn next_ip(&self) -> u32 {
        u32::from(self.ip) + u32::from(self.length)
    }

    /// Absolute fixable span of operand `index` relative to `start`.
    pub fn operand_span(&self, index: usize, start: usize) -> Option<Range<usize>> {
        let span = self.operands.get(index)?.fixable.clone()?;
        Some(start + usize::from(span.start)..start + usize::from(span.end))
    }

    /// First operand that is a branch target, near or far.
    pub fn branch_operand(&self) -> Option<&Operand> {
        self.operands.iter().find(|op| {
            matches!(
                op.kind,
                OperandKind::NearBranch { .. } | OperandKind::FarBranch { .. }
            )
        })
    }

    pub fn memory_operand(&self) -> Option<&Operand> {
        self.operands
            .iter()
            .find(|op| matches!(op.kind, OperandKind::Memory { .. }))
    }

    /// Intel syntax text.
    pub fn text(&self) -> String {
        let mut formatter = IntelFormatter::new();
        let mut out = String::new();
        formatter.format(&self.raw, &mut out);
        out
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}  {}", self.ip, self.text())
    }
}
