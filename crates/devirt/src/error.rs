//! Error taxonomy of the inference core.
//!
//! Only initialization problems abort a disassembly. Everything the
//! processor raises is scoped to one program state: the driver logs it,
//! records the offset as unresolved where that is meaningful, and carries
//! on with the rest of the agenda.

use thiserror::Error;

use devirt_interface::{ConstantsError, DecodeError, ImageError, MetadataToken};

use crate::emulator::EmulationError;

/// Fatal errors propagated out of [`Disassembler::run`](crate::Disassembler::run).
#[derive(Debug, Error)]
pub enum DisasmError {
    /// The entry instruction of a seeded export failed to decode.
    #[error("failed to decode the entry of export {export} at {offset:#x}")]
    SeedDecode {
        /// Export whose seed failed.
        export: u32,
        /// Entry offset of that export.
        offset: u64,
        /// The underlying decoder error.
        #[source]
        source: DecodeError,
    },
    /// The constants table failed validation.
    #[error("corrupted constants table")]
    Constants(#[from] ConstantsError),
}

/// Per-state failures. Raising one drops the offending state's successor
/// fan-out and nothing else.
#[derive(Debug, Error)]
pub enum StateError {
    /// A `CALL` targets an address with no export entry.
    #[error("call at {offset:#x} targets {address:#x}, which is not an export")]
    UnsupportedCall {
        /// Offset of the call instruction.
        offset: u64,
        /// The inferred target address.
        address: u64,
    },
    /// A `TRY` opened a FAULT clause, which the VM never emits.
    #[error("unsupported FAULT clause at {offset:#x}")]
    UnsupportedFault {
        /// Offset of the `TRY` instruction.
        offset: u64,
    },
    /// A `TRY` handler-type byte outside the resolved table.
    #[error("unknown handler type byte {raw:#04x} at {offset:#x}")]
    UnknownEhType {
        /// Offset of the `TRY` instruction.
        offset: u64,
        /// The unmapped byte.
        raw: u8,
    },
    /// A `VCALL` selector byte outside the resolved table.
    #[error("unmapped v-call selector {selector:#04x} at {offset:#x}")]
    UnsupportedVCall {
        /// Offset of the `VCALL` instruction.
        offset: u64,
        /// The unmapped selector byte.
        selector: u8,
    },
    /// An `ECALL` kind byte outside the resolved table.
    #[error("unmapped ecall kind {raw:#04x} at {offset:#x}")]
    UnsupportedECall {
        /// Offset of the `VCALL` instruction.
        offset: u64,
        /// The unmapped kind byte.
        raw: u8,
    },
    /// A metadata token did not resolve to the member kind the instruction
    /// requires.
    #[error("token {token} at {offset:#x} does not resolve to the expected member kind")]
    UnexpectedMember {
        /// Offset of the referencing instruction.
        offset: u64,
        /// The token in question.
        token: MetadataToken,
    },
    /// The partial emulator could not produce a concrete value.
    #[error("inference failed at {offset:#x}")]
    Inference {
        /// Offset of the instruction whose operand was being inferred.
        offset: u64,
        /// The underlying emulator error.
        #[source]
        source: EmulationError,
    },
    /// The symbolic stack under-ran; the stream or the processor is broken.
    #[error("symbolic stack underflow at {offset:#x}")]
    StackUnderflow {
        /// Offset of the popping instruction.
        offset: u64,
    },
    /// The decoder rejected the stream mid-flight.
    #[error("decode failed")]
    Decode(#[from] DecodeError),
    /// Metadata reference resolution failed.
    #[error("metadata resolution failed")]
    Image(#[from] ImageError),
    /// An invariant of the processor itself was violated.
    #[error("internal error at {offset:#x}: {message}")]
    Internal {
        /// Offset of the instruction being processed.
        offset: u64,
        /// What went wrong.
        message: &'static str,
    },
}

impl StateError {
    /// Whether this failure marks the instruction as permanently
    /// unsupported, in which case its offset is recorded unresolved.
    pub(crate) fn is_unsupported(&self) -> bool {
        matches!(
            self,
            StateError::UnsupportedCall { .. }
                | StateError::UnsupportedFault { .. }
                | StateError::UnknownEhType { .. }
                | StateError::UnsupportedVCall { .. }
                | StateError::UnsupportedECall { .. }
                | StateError::UnexpectedMember { .. }
                | StateError::Image(_)
        )
    }

    /// Whether this failure indicates a bug rather than an analysis limit.
    pub(crate) fn is_diagnostic(&self) -> bool {
        matches!(
            self,
            StateError::StackUnderflow { .. } | StateError::Internal { .. }
        )
    }
}
