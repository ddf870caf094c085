//! Scripted collaborators for tests and benchmarks.
//!
//! Real inputs come out of an obfuscated host binary; the tests instead
//! assemble tiny instruction streams with [`Assembler`], decode them with
//! [`StreamDecoder`] (which models the interpreter's rolling key schedule,
//! so entry and exit keys behave like the real thing) and resolve metadata
//! against a declarative [`TestImage`].

use std::collections::HashMap;

use devirt_interface::{
    DecodeError, DecodedInstruction, ECallCode, EhType, FieldDesc, ILCode, ImageError,
    InstructionDecoder, MemberRef, MetadataImage, MetadataToken, MethodDesc, MethodSignature,
    Operand, OperandType, TokenKind, TypeDesc, VCallCode, VmConstants, VmFlag, VmRegister, VmType,
};

const VCALL_TABLE: &[VCallCode] = &[
    VCallCode::Ecall,
    VCallCode::Box,
    VCallCode::Unbox,
    VCallCode::Cast,
    VCallCode::NewObj,
    VCallCode::LdFld,
    VCallCode::StFld,
    VCallCode::LdToken,
    VCallCode::Throw,
    VCallCode::SizeOf,
    VCallCode::InitObj,
    VCallCode::CkFinite,
    VCallCode::LocAlloc,
    VCallCode::Break,
];

const ECALL_TABLE: &[ECallCode] = &[
    ECallCode::Call,
    ECallCode::CallVirt,
    ECallCode::NewObj,
    ECallCode::CallVirtConstrained,
];

const EH_TABLE: &[EhType] = &[EhType::Catch, EhType::Filter, EhType::Fault, EhType::Finally];

const FLAG_TABLE: &[VmFlag] = &[
    VmFlag::Overflow,
    VmFlag::Carry,
    VmFlag::Zero,
    VmFlag::Sign,
    VmFlag::Unsigned,
    VmFlag::Behav1,
    VmFlag::Behav2,
    VmFlag::Behav3,
];

const REGISTER_TABLE: &[VmRegister] = &[
    VmRegister::R0,
    VmRegister::R1,
    VmRegister::R2,
    VmRegister::R3,
    VmRegister::R4,
    VmRegister::R5,
    VmRegister::R6,
    VmRegister::R7,
    VmRegister::Bp,
    VmRegister::Sp,
    VmRegister::Ip,
    VmRegister::Fl,
    VmRegister::K1,
    VmRegister::K2,
    VmRegister::M1,
    VmRegister::M2,
];

/// Signature flags bit marking instance methods in [`test_constants`].
pub const FLAG_INSTANCE: u8 = 0x40;

/// A constants table with identity-style encodings: opcode bytes follow
/// [`ILCode::ALL`] order, register bytes follow the canonical register
/// order, and so on.
pub fn test_constants() -> VmConstants {
    #[allow(clippy::cast_possible_truncation)]
    fn enumerate<T: Copy>(table: &[T]) -> HashMap<u8, T> {
        table
            .iter()
            .enumerate()
            .map(|(raw, &value)| (raw as u8, value))
            .collect()
    }

    VmConstants {
        registers: enumerate(REGISTER_TABLE),
        flags: enumerate(FLAG_TABLE),
        opcodes: enumerate(ILCode::ALL),
        vcalls: enumerate(VCALL_TABLE),
        ecall_opcodes: enumerate(ECALL_TABLE),
        helper_init: 0x2A,
        flag_instance: FLAG_INSTANCE,
        eh_types: enumerate(EH_TABLE),
    }
}

/// Register operand under [`test_constants`] encodings.
pub fn reg(register: VmRegister) -> Operand {
    Operand::Register(register as u8)
}

/// Selector byte of a v-call under [`test_constants`] encodings.
#[allow(clippy::cast_possible_truncation)]
pub fn vcall_selector(code: VCallCode) -> u32 {
    VCALL_TABLE.iter().position(|&c| c == code).unwrap() as u32
}

/// Handler-type byte under [`test_constants`] encodings.
#[allow(clippy::cast_possible_truncation)]
pub fn eh_byte(eh_type: EhType) -> u32 {
    EH_TABLE.iter().position(|&t| t == eh_type).unwrap() as u32
}

/// `ECALL` descriptor dword: kind byte on top of a reference id.
pub fn ecall_descriptor(kind: ECallCode, id: u32) -> u32 {
    let raw = ECALL_TABLE.iter().position(|&k| k == kind).unwrap() as u32;
    (raw << 24) | (id & 0x00FF_FFFF)
}

/// One step of the rolling key schedule.
fn advance_key(key: u32, byte: u8) -> u32 {
    key.wrapping_mul(0x0100_0193) ^ u32::from(byte)
}

/// Assembles an instruction stream for [`StreamDecoder`].
#[derive(Debug)]
pub struct Assembler {
    base: u64,
    bytes: Vec<u8>,
    encode: HashMap<ILCode, u8>,
}

impl Assembler {
    /// Starts an empty stream based at `base`.
    pub fn new(constants: &VmConstants, base: u64) -> Self {
        Self {
            base,
            bytes: Vec::new(),
            encode: constants
                .opcodes
                .iter()
                .map(|(&raw, &code)| (code, raw))
                .collect(),
        }
    }

    /// Offset the next instruction will land on.
    #[allow(clippy::cast_possible_truncation)]
    pub fn here(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    /// Emits one instruction and returns its offset.
    ///
    /// # Panics
    ///
    /// Panics when the operand shape does not match the opcode's descriptor.
    pub fn emit(&mut self, code: ILCode, operand: Operand) -> u64 {
        let offset = self.here();
        self.bytes.push(self.encode[&code]);
        match (code.op().operand_type, operand) {
            (OperandType::None, Operand::None) => {}
            (OperandType::Register, Operand::Register(raw)) => self.bytes.push(raw),
            (OperandType::ImmediateDword, Operand::ImmediateDword(value)) => {
                self.bytes.extend_from_slice(&value.to_le_bytes());
            }
            (OperandType::ImmediateQword, Operand::ImmediateQword(value)) => {
                self.bytes.extend_from_slice(&value.to_le_bytes());
            }
            (OperandType::SwitchTable, Operand::SwitchTable(targets)) => {
                self.bytes.push(u8::try_from(targets.len()).unwrap());
                for target in targets {
                    self.bytes.extend_from_slice(&target.to_le_bytes());
                }
            }
            (expected, operand) => {
                panic!("operand {operand:?} does not fit {code:?} (expects {expected:?})")
            }
        }
        offset
    }

    /// Fills the stream with invalid bytes up to `offset`, so stray decodes
    /// of the padding fail loudly.
    pub fn pad_to(&mut self, offset: u64) {
        assert!(offset >= self.here(), "cannot pad backwards");
        self.bytes.resize((offset - self.base) as usize, 0xFF);
    }

    /// Finishes the stream into a decoder.
    pub fn into_decoder(self, constants: &VmConstants) -> StreamDecoder {
        StreamDecoder {
            base: self.base,
            bytes: self.bytes,
            opcodes: constants.opcodes.clone(),
        }
    }
}

/// Decodes an assembled stream, chaining the cipher key over every consumed
/// byte exactly like the bundled interpreter does.
#[derive(Debug)]
pub struct StreamDecoder {
    base: u64,
    bytes: Vec<u8>,
    opcodes: HashMap<u8, ILCode>,
}

impl StreamDecoder {
    fn byte(&self, offset: u64) -> Result<u8, DecodeError> {
        offset
            .checked_sub(self.base)
            .and_then(|index| self.bytes.get(usize::try_from(index).ok()?))
            .copied()
            .ok_or(DecodeError::OutOfBounds { offset })
    }

    fn operand_bytes(&self, offset: u64, count: u64) -> Result<Vec<u8>, DecodeError> {
        (0..count)
            .map(|i| {
                self.byte(offset + i)
                    .map_err(|_| DecodeError::Truncated { offset })
            })
            .collect()
    }
}

impl InstructionDecoder for StreamDecoder {
    fn decode(&self, offset: u64, key: u32) -> Result<DecodedInstruction, DecodeError> {
        let raw = self.byte(offset)?;
        let code = *self
            .opcodes
            .get(&raw)
            .ok_or(DecodeError::UnknownOpcode { offset, raw })?;

        let (operand, operand_len) = match code.op().operand_type {
            OperandType::None => (Operand::None, 0),
            OperandType::Register => (Operand::Register(self.byte(offset + 1)?), 1),
            OperandType::ImmediateDword => {
                let bytes = self.operand_bytes(offset + 1, 4)?;
                (
                    Operand::ImmediateDword(u32::from_le_bytes(bytes.try_into().unwrap())),
                    4,
                )
            }
            OperandType::ImmediateQword => {
                let bytes = self.operand_bytes(offset + 1, 8)?;
                (
                    Operand::ImmediateQword(u64::from_le_bytes(bytes.try_into().unwrap())),
                    8,
                )
            }
            OperandType::SwitchTable => {
                let count = u64::from(self.byte(offset + 1).map_err(|_| {
                    DecodeError::Truncated { offset }
                })?);
                let mut targets = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let bytes = self.operand_bytes(offset + 2 + i * 8, 8)?;
                    targets.push(u64::from_le_bytes(bytes.try_into().unwrap()));
                }
                (Operand::SwitchTable(targets), 1 + count * 8)
            }
        };

        let size = u8::try_from(1 + operand_len).expect("instruction size fits a byte");
        let next_key = (0..u64::from(size)).try_fold(key, |key, i| {
            Ok::<_, DecodeError>(advance_key(key, self.byte(offset + i)?))
        })?;

        Ok(DecodedInstruction {
            offset,
            size,
            code,
            operand,
            next_key,
        })
    }
}

/// Declarative metadata image.
#[derive(Debug, Default)]
pub struct TestImage {
    members: HashMap<u32, MemberRef>,
    references: HashMap<u32, MetadataToken>,
}

impl TestImage {
    /// An empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type member.
    pub fn add_type(&mut self, token: u32, vm_type: VmType, is_void: bool) -> MetadataToken {
        let token = MetadataToken(token);
        self.members.insert(
            token.0,
            MemberRef::Type(TypeDesc {
                token,
                vm_type,
                is_void,
            }),
        );
        token
    }

    /// Registers a method member.
    pub fn add_method(&mut self, token: u32, signature: MethodSignature) -> MetadataToken {
        let token = MetadataToken(token);
        self.members
            .insert(token.0, MemberRef::Method(MethodDesc { token, signature }));
        token
    }

    /// Registers a field member.
    pub fn add_field(&mut self, token: u32, vm_type: VmType) -> MetadataToken {
        let token = MetadataToken(token);
        self.members
            .insert(token.0, MemberRef::Field(FieldDesc { token, vm_type }));
        token
    }

    /// Maps a VM-level reference id onto a token.
    pub fn map_reference(&mut self, id: u32, token: MetadataToken) {
        self.references.insert(id, token);
    }
}

impl MetadataImage for TestImage {
    fn resolve_member(&self, token: MetadataToken) -> Option<MemberRef> {
        self.members.get(&token.0).cloned()
    }

    fn resolve_reference(
        &self,
        offset: u64,
        id: u32,
        allowed: &[TokenKind],
    ) -> Result<MetadataToken, ImageError> {
        let token = *self
            .references
            .get(&id)
            .ok_or(ImageError::UnknownReference { offset, id })?;
        match token.kind() {
            Some(kind) if allowed.contains(&kind) => Ok(token),
            _ => Err(ImageError::DisallowedKind { offset, id, token }),
        }
    }
}
