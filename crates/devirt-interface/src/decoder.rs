//! The instruction-decoder contract.

use thiserror::Error;

use crate::il::{ILCode, Operand};

/// One instruction decoded from the encrypted stream, before any inference
/// has run over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    /// Offset the instruction was decoded at.
    pub offset: u64,
    /// Number of stream bytes the instruction occupies.
    pub size: u8,
    /// Logical opcode.
    pub code: ILCode,
    /// Inline operand.
    pub operand: Operand,
    /// Stream-cipher key decoding continues with after this instruction.
    pub next_key: u32,
}

/// Decodes single instructions out of the host binary's embedded,
/// stream-cipher-encrypted instruction section.
///
/// The cipher key evolves with every byte consumed, so the same offset can
/// only be decoded by arriving with the key the obfuscator arranged for it;
/// `decode` reports the follow-up key alongside the instruction.
pub trait InstructionDecoder {
    /// Decodes the instruction at `offset` under `key`.
    fn decode(&self, offset: u64, key: u32) -> Result<DecodedInstruction, DecodeError>;
}

/// Errors produced by an [`InstructionDecoder`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The offset lies outside the instruction section.
    #[error("offset {offset:#x} is outside the instruction stream")]
    OutOfBounds {
        /// Offending offset.
        offset: u64,
    },
    /// The decrypted opcode byte maps to no known instruction.
    #[error("byte {raw:#04x} at {offset:#x} is not a known opcode")]
    UnknownOpcode {
        /// Offset of the opcode byte.
        offset: u64,
        /// The decrypted byte value.
        raw: u8,
    },
    /// The stream ended in the middle of an operand.
    #[error("instruction at {offset:#x} is truncated")]
    Truncated {
        /// Offset of the truncated instruction.
        offset: u64,
    },
}
