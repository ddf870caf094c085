//! The resolved constants table.
//!
//! Every obfuscated binary randomizes the byte encodings of registers,
//! flags, opcodes and v-call selectors in a one-time static initializer.
//! The constants-resolution pass recovers those encodings; the core only
//! ever sees the result, collected in [`VmConstants`].

use std::collections::HashMap;

use thiserror::Error;

use crate::il::ILCode;

/// The interpreter's register file, in its canonical order.
///
/// `R0`..`R7` are general purpose (`R0` doubles as the return-value
/// register), `BP`/`SP`/`IP` mirror the machine frame, `FL` holds the
/// comparison flags and `K1`/`K2`/`M1`/`M2` are interpreter scratch space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum VmRegister {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    Bp,
    Sp,
    Ip,
    Fl,
    K1,
    K2,
    M1,
    M2,
}

impl VmRegister {
    /// Number of registers in the file.
    pub const COUNT: usize = 16;

    /// Dense index of this register, suitable for array-backed files.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Bits of the `FL` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum VmFlag {
    Overflow,
    Carry,
    Zero,
    Sign,
    Unsigned,
    Behav1,
    Behav2,
    Behav3,
}

/// Protected-region kinds as encoded by `TRY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum EhType {
    Catch,
    Filter,
    Fault,
    Finally,
}

/// Sub-opcodes of the polymorphic `VCALL` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum VCallCode {
    Ecall,
    Box,
    Unbox,
    Cast,
    NewObj,
    LdFld,
    StFld,
    LdToken,
    Throw,
    SizeOf,
    InitObj,
    CkFinite,
    LocAlloc,
    Break,
}

/// Call kinds of the `ECALL` v-call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ECallCode {
    Call,
    CallVirt,
    NewObj,
    CallVirtConstrained,
}

/// Fully resolved constants table for one obfuscated binary.
///
/// All maps are keyed by the raw byte value found in the instruction stream
/// or in v-call operands.
#[derive(Debug, Clone, Default)]
pub struct VmConstants {
    /// Raw byte → register.
    pub registers: HashMap<u8, VmRegister>,
    /// Raw byte → flag bit.
    pub flags: HashMap<u8, VmFlag>,
    /// Raw byte → logical opcode.
    pub opcodes: HashMap<u8, ILCode>,
    /// Raw byte → v-call sub-opcode.
    pub vcalls: HashMap<u8, VCallCode>,
    /// Raw byte → `ECALL` call kind.
    pub ecall_opcodes: HashMap<u8, ECallCode>,
    /// Id of the runtime helper invoked by the obfuscated module initializer.
    pub helper_init: u8,
    /// Bit set in an export's signature flags when the method has a `this`.
    pub flag_instance: u8,
    /// Raw byte → protected-region kind.
    pub eh_types: HashMap<u8, EhType>,
}

impl VmConstants {
    /// Looks up a raw register byte.
    pub fn register(&self, raw: u8) -> Option<VmRegister> {
        self.registers.get(&raw).copied()
    }

    /// Looks up a raw v-call selector byte.
    pub fn vcall(&self, raw: u8) -> Option<VCallCode> {
        self.vcalls.get(&raw).copied()
    }

    /// Looks up a raw `ECALL` kind byte.
    pub fn ecall(&self, raw: u8) -> Option<ECallCode> {
        self.ecall_opcodes.get(&raw).copied()
    }

    /// Looks up a raw protected-region kind byte.
    pub fn eh_type(&self, raw: u8) -> Option<EhType> {
        self.eh_types.get(&raw).copied()
    }

    /// Sanity-checks that the resolver filled every category this crate's
    /// consumers rely on. A table failing this check means the host binary
    /// was mis-parsed, and no disassembly should be attempted with it.
    pub fn validate(&self) -> Result<(), ConstantsError> {
        for (name, empty) in [
            ("registers", self.registers.is_empty()),
            ("opcodes", self.opcodes.is_empty()),
            ("vcalls", self.vcalls.is_empty()),
            ("ecall_opcodes", self.ecall_opcodes.is_empty()),
            ("eh_types", self.eh_types.is_empty()),
        ] {
            if empty {
                return Err(ConstantsError::EmptyCategory { name });
            }
        }
        if self.flag_instance == 0 {
            return Err(ConstantsError::MissingInstanceFlag);
        }
        Ok(())
    }
}

/// Errors raised by [`VmConstants::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConstantsError {
    /// A constants category came back empty from the resolver.
    #[error("constants category `{name}` is empty")]
    EmptyCategory {
        /// Name of the empty category.
        name: &'static str,
    },
    /// The instance-signature flag was not resolved.
    #[error("the instance signature flag was not resolved")]
    MissingInstanceFlag,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_categories() {
        let constants = VmConstants::default();
        assert_eq!(
            constants.validate(),
            Err(ConstantsError::EmptyCategory { name: "registers" })
        );
    }
}
