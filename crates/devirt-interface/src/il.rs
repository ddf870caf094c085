//! The logical instruction set and its static metadata.
//!
//! Raw opcode bytes in the instruction stream are randomized per obfuscated
//! binary; the constants resolver maps them onto [`ILCode`]s, and everything
//! downstream works on the logical codes plus the static [`OpCode`] table
//! defined here.

use std::fmt;

/// Width/kind of a value on the VM evaluation stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VmType {
    /// Nothing is known about the value yet.
    #[default]
    Unknown,
    /// Unsigned 8-bit integer.
    Byte,
    /// Unsigned 16-bit integer.
    Word,
    /// Unsigned 32-bit integer.
    Dword,
    /// Unsigned 64-bit integer.
    Qword,
    /// 32-bit IEEE float.
    Real32,
    /// 64-bit IEEE float.
    Real64,
    /// Native pointer (stack slot references, code addresses).
    Ptr,
    /// Managed object reference.
    Object,
}

impl VmType {
    /// Least upper bound of two inferred types: a specific type absorbs
    /// `Unknown`, and disagreeing specific types widen back to `Unknown`.
    pub fn widen(self, other: VmType) -> VmType {
        match (self, other) {
            (VmType::Unknown, ty) | (ty, VmType::Unknown) => ty,
            (a, b) if a == b => a,
            _ => VmType::Unknown,
        }
    }
}

/// How an instruction transfers control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowControl {
    /// Falls through to the next instruction.
    Next,
    /// Unconditional transfer to a computed target.
    Jump,
    /// Transfer to a computed target or fall through.
    ConditionalJump,
    /// Transfer into a callee that eventually resumes after this instruction.
    Call,
    /// Leaves the current function.
    Return,
}

/// Shape of the inline operand following the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandType {
    /// No inline operand.
    None,
    /// One raw register byte, resolved through `VmConstants::registers`.
    Register,
    /// Little-endian `u32` immediate.
    ImmediateDword,
    /// Little-endian `u64` immediate.
    ImmediateQword,
    /// Jump table: a count byte followed by that many `u64` targets.
    SwitchTable,
}

/// A decoded inline operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Operand {
    /// No operand.
    #[default]
    None,
    /// Raw register byte as it appears in the stream.
    Register(u8),
    /// 32-bit immediate.
    ImmediateDword(u32),
    /// 64-bit immediate.
    ImmediateQword(u64),
    /// Absolute jump targets of a `SWT` table.
    SwitchTable(Vec<u64>),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Register(byte) => write!(f, "r[{byte:#04x}]"),
            Operand::ImmediateDword(value) => write!(f, "{value:#x}"),
            Operand::ImmediateQword(value) => write!(f, "{value:#x}"),
            Operand::SwitchTable(targets) => {
                f.write_str("[")?;
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{target:#x}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Stack pops performed by an instruction.
///
/// `Fixed` lists the slots in pop order (top of stack first); a slot declared
/// [`VmType::Unknown`] accepts any value and leaves its inferred type
/// untouched. `Var` marks opcodes whose pop count is computed by a dedicated
/// processor path (calls, v-calls, protected-region bookkeeping); meeting it
/// in the generic transfer function is an internal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopBehavior {
    /// Pops nothing.
    None,
    /// Pops exactly the listed slots, top of stack first.
    Fixed(&'static [VmType]),
    /// Pop count depends on inferred operands.
    Var,
}

impl PopBehavior {
    /// Slot types in pop order, when statically known.
    pub fn slots(self) -> Option<&'static [VmType]> {
        match self {
            PopBehavior::Fixed(slots) => Some(slots),
            _ => None,
        }
    }
}

/// Stack pushes performed by an instruction; the VM never pushes more than
/// one result per instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushBehavior {
    /// Pushes nothing.
    None,
    /// Pushes one value of the given type.
    One(VmType),
    /// Push count depends on inferred operands.
    Var,
}

/// Static descriptor of one [`ILCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCode {
    /// The logical code this descriptor belongs to.
    pub code: ILCode,
    /// Whether executing the instruction rewrites the flags register.
    pub affects_flags: bool,
    /// Stack pops.
    pub pops: PopBehavior,
    /// Stack pushes.
    pub pushes: PushBehavior,
    /// Inline operand shape.
    pub operand_type: OperandType,
    /// Control-flow class.
    pub flow_control: FlowControl,
}

macro_rules! il_codes {
    ($($variant:ident = $mnemonic:literal =>
        $flags:literal, $pops:expr, $pushes:expr, $operand:ident, $flow:ident;)*) => {
        /// Logical instruction codes understood by the devirtualizer.
        ///
        /// The names follow the interpreter's mnemonics; width suffixes name
        /// the operand width the instruction works on.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[allow(missing_docs)] // the mnemonics speak for themselves
        pub enum ILCode {
            $($variant,)*
        }

        impl ILCode {
            /// Every logical code, in declaration order.
            pub const ALL: &'static [ILCode] = &[$(ILCode::$variant),*];

            /// Static descriptor of this code.
            pub fn op(self) -> &'static OpCode {
                match self {
                    $(ILCode::$variant => {
                        const OP: OpCode = OpCode {
                            code: ILCode::$variant,
                            affects_flags: $flags,
                            pops: $pops,
                            pushes: $pushes,
                            operand_type: OperandType::$operand,
                            flow_control: FlowControl::$flow,
                        };
                        &OP
                    })*
                }
            }

            /// Assembler-style mnemonic, as printed in listings.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(ILCode::$variant => $mnemonic,)*
                }
            }
        }
    };
}

use PopBehavior as Pop;
use PushBehavior as Push;
use VmType::{Byte, Dword, Object, Ptr, Qword, Real32, Real64, Unknown, Word};

il_codes! {
    Nop = "NOP" => false, Pop::None, Push::None, None, Next;

    // Indirect loads: pop a pointer, push the pointee.
    LindPtr = "LIND_PTR" => false, Pop::Fixed(&[Ptr]), Push::One(Ptr), None, Next;
    LindByte = "LIND_BYTE" => false, Pop::Fixed(&[Ptr]), Push::One(Byte), None, Next;
    LindWord = "LIND_WORD" => false, Pop::Fixed(&[Ptr]), Push::One(Word), None, Next;
    LindDword = "LIND_DWORD" => false, Pop::Fixed(&[Ptr]), Push::One(Dword), None, Next;
    LindQword = "LIND_QWORD" => false, Pop::Fixed(&[Ptr]), Push::One(Qword), None, Next;
    LindObject = "LIND_OBJECT" => false, Pop::Fixed(&[Ptr]), Push::One(Object), None, Next;

    // Indirect stores: pop the value, then the destination pointer.
    SindPtr = "SIND_PTR" => false, Pop::Fixed(&[Ptr, Ptr]), Push::None, None, Next;
    SindByte = "SIND_BYTE" => false, Pop::Fixed(&[Byte, Ptr]), Push::None, None, Next;
    SindWord = "SIND_WORD" => false, Pop::Fixed(&[Word, Ptr]), Push::None, None, Next;
    SindDword = "SIND_DWORD" => false, Pop::Fixed(&[Dword, Ptr]), Push::None, None, Next;
    SindQword = "SIND_QWORD" => false, Pop::Fixed(&[Qword, Ptr]), Push::None, None, Next;
    SindObject = "SIND_OBJECT" => false, Pop::Fixed(&[Object, Ptr]), Push::None, None, Next;

    Pop = "POP" => false, Pop::Fixed(&[Unknown]), Push::None, Register, Next;

    PushrByte = "PUSHR_BYTE" => false, Pop::None, Push::One(Byte), Register, Next;
    PushrWord = "PUSHR_WORD" => false, Pop::None, Push::One(Word), Register, Next;
    PushrDword = "PUSHR_DWORD" => false, Pop::None, Push::One(Dword), Register, Next;
    PushrQword = "PUSHR_QWORD" => false, Pop::None, Push::One(Qword), Register, Next;
    PushrObject = "PUSHR_OBJECT" => false, Pop::None, Push::One(Object), Register, Next;

    PushiDword = "PUSHI_DWORD" => false, Pop::None, Push::One(Dword), ImmediateDword, Next;
    PushiQword = "PUSHI_QWORD" => false, Pop::None, Push::One(Qword), ImmediateQword, Next;

    SxByte = "SX_BYTE" => false, Pop::Fixed(&[Byte]), Push::One(Dword), None, Next;
    SxWord = "SX_WORD" => false, Pop::Fixed(&[Word]), Push::One(Dword), None, Next;
    SxDword = "SX_DWORD" => false, Pop::Fixed(&[Dword]), Push::One(Qword), None, Next;
    ZxByte = "ZX_BYTE" => false, Pop::Fixed(&[Byte]), Push::One(Dword), None, Next;
    ZxWord = "ZX_WORD" => false, Pop::Fixed(&[Word]), Push::One(Dword), None, Next;
    ZxDword = "ZX_DWORD" => false, Pop::Fixed(&[Dword]), Push::One(Qword), None, Next;

    Cmp = "CMP" => true, Pop::Fixed(&[Unknown, Unknown]), Push::None, None, Next;
    CmpDword = "CMP_DWORD" => true, Pop::Fixed(&[Dword, Dword]), Push::None, None, Next;
    CmpQword = "CMP_QWORD" => true, Pop::Fixed(&[Qword, Qword]), Push::None, None, Next;
    CmpR32 = "CMP_R32" => true, Pop::Fixed(&[Real32, Real32]), Push::None, None, Next;
    CmpR64 = "CMP_R64" => true, Pop::Fixed(&[Real64, Real64]), Push::None, None, Next;

    // Branches pop the target first; conditional ones then pop the predicate.
    Jmp = "JMP" => false, Pop::Fixed(&[Ptr]), Push::None, None, Jump;
    Jz = "JZ" => false, Pop::Fixed(&[Ptr, Dword]), Push::None, None, ConditionalJump;
    Jnz = "JNZ" => false, Pop::Fixed(&[Ptr, Dword]), Push::None, None, ConditionalJump;
    Swt = "SWT" => false, Pop::Fixed(&[Dword]), Push::None, SwitchTable, ConditionalJump;

    AddDword = "ADD_DWORD" => true, Pop::Fixed(&[Dword, Dword]), Push::One(Dword), None, Next;
    AddQword = "ADD_QWORD" => true, Pop::Fixed(&[Qword, Qword]), Push::One(Qword), None, Next;
    AddR32 = "ADD_R32" => true, Pop::Fixed(&[Real32, Real32]), Push::One(Real32), None, Next;
    AddR64 = "ADD_R64" => true, Pop::Fixed(&[Real64, Real64]), Push::One(Real64), None, Next;
    SubR32 = "SUB_R32" => true, Pop::Fixed(&[Real32, Real32]), Push::One(Real32), None, Next;
    SubR64 = "SUB_R64" => true, Pop::Fixed(&[Real64, Real64]), Push::One(Real64), None, Next;
    MulDword = "MUL_DWORD" => true, Pop::Fixed(&[Dword, Dword]), Push::One(Dword), None, Next;
    MulQword = "MUL_QWORD" => true, Pop::Fixed(&[Qword, Qword]), Push::One(Qword), None, Next;
    MulR32 = "MUL_R32" => true, Pop::Fixed(&[Real32, Real32]), Push::One(Real32), None, Next;
    MulR64 = "MUL_R64" => true, Pop::Fixed(&[Real64, Real64]), Push::One(Real64), None, Next;
    DivDword = "DIV_DWORD" => true, Pop::Fixed(&[Dword, Dword]), Push::One(Dword), None, Next;
    DivQword = "DIV_QWORD" => true, Pop::Fixed(&[Qword, Qword]), Push::One(Qword), None, Next;
    DivR32 = "DIV_R32" => true, Pop::Fixed(&[Real32, Real32]), Push::One(Real32), None, Next;
    DivR64 = "DIV_R64" => true, Pop::Fixed(&[Real64, Real64]), Push::One(Real64), None, Next;
    RemDword = "REM_DWORD" => true, Pop::Fixed(&[Dword, Dword]), Push::One(Dword), None, Next;
    RemQword = "REM_QWORD" => true, Pop::Fixed(&[Qword, Qword]), Push::One(Qword), None, Next;
    RemR32 = "REM_R32" => true, Pop::Fixed(&[Real32, Real32]), Push::One(Real32), None, Next;
    RemR64 = "REM_R64" => true, Pop::Fixed(&[Real64, Real64]), Push::One(Real64), None, Next;

    // Shift amount is pushed last, so it pops first.
    ShlDword = "SHL_DWORD" => true, Pop::Fixed(&[Dword, Dword]), Push::One(Dword), None, Next;
    ShlQword = "SHL_QWORD" => true, Pop::Fixed(&[Dword, Qword]), Push::One(Qword), None, Next;
    ShrDword = "SHR_DWORD" => true, Pop::Fixed(&[Dword, Dword]), Push::One(Dword), None, Next;
    ShrQword = "SHR_QWORD" => true, Pop::Fixed(&[Dword, Qword]), Push::One(Qword), None, Next;

    // The interpreter's only bitwise primitive; the obfuscator lowers
    // AND/OR/XOR/NOT onto it.
    NorDword = "NOR_DWORD" => true, Pop::Fixed(&[Dword, Dword]), Push::One(Dword), None, Next;
    NorQword = "NOR_QWORD" => true, Pop::Fixed(&[Qword, Qword]), Push::One(Qword), None, Next;

    Fp = "FP" => false, Pop::Fixed(&[Dword]), Push::One(Ptr), None, Next;

    Call = "CALL" => false, Pop::Var, Push::Var, None, Call;
    Ret = "RET" => false, Pop::Var, Push::None, None, Return;
    Vcall = "VCALL" => false, Pop::Var, Push::Var, None, Call;
    Try = "TRY" => false, Pop::Var, Push::None, None, ConditionalJump;
    Leave = "LEAVE" => false, Pop::Var, Push::None, None, Next;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_absorbs_unknown_and_rejects_mismatch() {
        assert_eq!(VmType::Dword.widen(VmType::Unknown), VmType::Dword);
        assert_eq!(VmType::Unknown.widen(VmType::Ptr), VmType::Ptr);
        assert_eq!(VmType::Qword.widen(VmType::Qword), VmType::Qword);
        assert_eq!(VmType::Dword.widen(VmType::Object), VmType::Unknown);
    }

    #[test]
    fn descriptors_are_consistent() {
        for &code in ILCode::ALL {
            let op = code.op();
            assert_eq!(op.code, code);
            if let PopBehavior::Fixed(slots) = op.pops {
                assert!(!slots.is_empty(), "{code:?} declares an empty pop list");
            }
        }
    }

    #[test]
    fn branch_targets_pop_first() {
        // Target inference reads the last dependency slot, which is the
        // first slot popped; it must be a pointer for every branch.
        for &code in ILCode::ALL {
            let op = code.op();
            if matches!(op.flow_control, FlowControl::Jump)
                || (matches!(op.flow_control, FlowControl::ConditionalJump)
                    && op.operand_type != OperandType::SwitchTable
                    && code != ILCode::Try)
            {
                assert_eq!(op.pops.slots().and_then(|s| s.first()), Some(&VmType::Ptr));
            }
        }
    }
}
