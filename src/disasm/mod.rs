//! Decoder boundary.
//!
//! The analysis engine only needs "decode one instruction at this cursor".
//! [`Decoder`] is that contract; [`iced::IcedDecoder`] implements it for
//! 16-bit real-mode code.

pub mod iced;

use thiserror::Error;

use crate::core::instruction::Instruction;

/// Errors that can occur while decoding one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Bytes do not form a valid instruction
    #[error("invalid instruction")]
    InvalidInstruction,
    /// Input ended in the middle of an instruction
    #[error("insufficient bytes")]
    InsufficientBytes,
}

/// Result type for decoding
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Decodes one instruction from the start of `bytes`.
pub trait Decoder {
    /// Decode the instruction at the start of `bytes`, located at offset `ip`.
    ///
    /// Operands come back with their fixable spans filled in and their
    /// resolution left unresolved.
    fn decode(&self, bytes: &[u8], ip: u16) -> DecodeResult<Instruction>;

    /// Longest encoding the decoder may consume.
    fn max_instruction_length(&self) -> usize;

    fn name(&self) -> &str;
}
