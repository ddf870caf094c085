//! The partial emulator.
//!
//! Jump and call targets are pushed onto the VM stack like any other value,
//! so recovering them means concretely evaluating the slice of the program
//! that produced them. The emulator interprets exactly the subset needed
//! for address computation — immediate loads, register moves, integer
//! arithmetic and the widening conversions — over the data-dependency graph
//! inference has reconstructed so far. Everything else raises
//! [`EmulationError::NotSupported`], which the processor downgrades to an
//! unresolved-target warning.

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;

use devirt_interface::{ILCode, Operand, VmType};

use crate::{instruction::Instruction, symbolic::SymbolicValue};

/// A concrete value produced by emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConcreteValue {
    bits: u64,
    ty: VmType,
}

impl ConcreteValue {
    fn dword(value: u32) -> Self {
        Self {
            bits: u64::from(value),
            ty: VmType::Dword,
        }
    }

    fn qword(value: u64) -> Self {
        Self {
            bits: value,
            ty: VmType::Qword,
        }
    }

    pub(crate) fn as_u64(self) -> u64 {
        self.bits
    }

    pub(crate) fn as_u32(self) -> u32 {
        self.bits as u32
    }

    pub(crate) fn as_u8(self) -> u8 {
        self.bits as u8
    }
}

/// Errors raised while concretely evaluating a data-source graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmulationError {
    /// The graph contains an opcode outside the supported subset.
    #[error("opcode {0:?} is outside the emulated subset")]
    NotSupported(ILCode),
    /// A data source points at an offset with no recorded instruction.
    #[error("no instruction recorded at {offset:#x}")]
    MissingSource {
        /// The dangling offset.
        offset: u64,
    },
    /// The dependency graph loops through itself.
    #[error("cyclic data dependency through {offset:#x}")]
    Cycle {
        /// Offset where the cycle was detected.
        offset: u64,
    },
    /// A register was read before any tracked path wrote it.
    #[error("register content produced at {offset:#x} is unknown")]
    UnknownRegister {
        /// Offset of the reading instruction.
        offset: u64,
    },
    /// Distinct data sources evaluated to distinct values.
    #[error("ambiguous concrete value ({first:#x} vs {second:#x})")]
    Ambiguous {
        /// Value of the first source.
        first: u64,
        /// The disagreeing value.
        second: u64,
    },
    /// Integer division by a concrete zero.
    #[error("division by zero")]
    DivisionByZero,
    /// The emulated stack under-ran; the dependency graph is malformed.
    #[error("emulator stack underflow")]
    StackUnderflow,
}

/// Evaluates every data source of `value` and requires them to agree.
pub(crate) fn concrete_value(
    arena: &BTreeMap<u64, Instruction>,
    value: &SymbolicValue,
) -> Result<ConcreteValue, EmulationError> {
    let mut result: Option<ConcreteValue> = None;
    for source in value.sources() {
        let evaluated = PartialEmulator::new(arena).emulate_source(source)?;
        match result {
            None => result = Some(evaluated),
            Some(first) if first.bits != evaluated.bits => {
                return Err(EmulationError::Ambiguous {
                    first: first.bits,
                    second: evaluated.bits,
                })
            }
            Some(_) => {}
        }
    }
    // A symbolic value always has at least one producer by construction.
    result.ok_or(EmulationError::StackUnderflow)
}

/// One emulation run over an instruction arena.
#[derive(Debug)]
pub(crate) struct PartialEmulator<'a> {
    arena: &'a BTreeMap<u64, Instruction>,
    stack: Vec<ConcreteValue>,
    memo: HashMap<u64, ConcreteValue>,
    in_flight: HashSet<u64>,
}

impl<'a> PartialEmulator<'a> {
    pub(crate) fn new(arena: &'a BTreeMap<u64, Instruction>) -> Self {
        Self {
            arena,
            stack: Vec::new(),
            memo: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    /// Emulates the producer at `offset`: first its dependency closure,
    /// depth-first and memoized, then the instruction itself. Returns the
    /// value left on top of the emulated stack.
    pub(crate) fn emulate_source(&mut self, offset: u64) -> Result<ConcreteValue, EmulationError> {
        if let Some(&known) = self.memo.get(&offset) {
            return Ok(known);
        }
        if !self.in_flight.insert(offset) {
            return Err(EmulationError::Cycle { offset });
        }

        let result = self.emulate_uncached(offset);
        self.in_flight.remove(&offset);

        let value = result?;
        self.memo.insert(offset, value);
        Ok(value)
    }

    fn emulate_uncached(&mut self, offset: u64) -> Result<ConcreteValue, EmulationError> {
        let instr = self
            .arena
            .get(&offset)
            .ok_or(EmulationError::MissingSource { offset })?;

        for (_, dependency) in instr.dependencies.iter() {
            let value = self.value_of(dependency)?;
            self.stack.push(value);
        }
        self.execute(instr)?;
        self.pop()
    }

    /// Evaluates a symbolic value; all of its sources must agree.
    fn value_of(&mut self, value: &SymbolicValue) -> Result<ConcreteValue, EmulationError> {
        let mut result: Option<ConcreteValue> = None;
        for source in value.sources() {
            let evaluated = self.emulate_source(source)?;
            match result {
                None => result = Some(evaluated),
                Some(first) if first.bits != evaluated.bits => {
                    return Err(EmulationError::Ambiguous {
                        first: first.bits,
                        second: evaluated.bits,
                    })
                }
                Some(_) => {}
            }
        }
        result.ok_or(EmulationError::StackUnderflow)
    }

    fn execute(&mut self, instr: &Instruction) -> Result<(), EmulationError> {
        match instr.code() {
            ILCode::PushiDword => {
                let Operand::ImmediateDword(value) = instr.operand else {
                    return Err(EmulationError::NotSupported(instr.code()));
                };
                self.stack.push(ConcreteValue::dword(value));
            }
            ILCode::PushiQword => {
                let Operand::ImmediateQword(value) = instr.operand else {
                    return Err(EmulationError::NotSupported(instr.code()));
                };
                self.stack.push(ConcreteValue::qword(value));
            }

            // Register moves carry their dependency's value through
            // unchanged. A move with no recorded dependency reads a
            // register no tracked path ever wrote.
            ILCode::PushrByte
            | ILCode::PushrWord
            | ILCode::PushrDword
            | ILCode::PushrQword
            | ILCode::PushrObject
            | ILCode::Pop => {
                if instr.dependencies.is_empty() {
                    return Err(EmulationError::UnknownRegister {
                        offset: instr.offset,
                    });
                }
            }

            ILCode::SxByte => {
                let value = self.pop()?;
                self.stack
                    .push(ConcreteValue::dword(i32::from(value.as_u8() as i8) as u32));
            }
            ILCode::SxWord => {
                let value = self.pop()?;
                self.stack
                    .push(ConcreteValue::dword(i32::from(value.as_u32() as u16 as i16) as u32));
            }
            ILCode::SxDword => {
                let value = self.pop()?;
                self.stack
                    .push(ConcreteValue::qword(i64::from(value.as_u32() as i32) as u64));
            }
            ILCode::ZxByte => {
                let value = self.pop()?;
                self.stack
                    .push(ConcreteValue::dword(u32::from(value.as_u8())));
            }
            ILCode::ZxWord => {
                let value = self.pop()?;
                self.stack
                    .push(ConcreteValue::dword(u32::from(value.as_u32() as u16)));
            }
            ILCode::ZxDword => {
                let value = self.pop()?;
                self.stack
                    .push(ConcreteValue::qword(u64::from(value.as_u32())));
            }

            ILCode::AddDword => self.binary_dword(|a, b| Ok(a.wrapping_add(b)))?,
            ILCode::AddQword => self.binary_qword(|a, b| Ok(a.wrapping_add(b)))?,
            ILCode::MulDword => self.binary_dword(|a, b| Ok(a.wrapping_mul(b)))?,
            ILCode::MulQword => self.binary_qword(|a, b| Ok(a.wrapping_mul(b)))?,
            ILCode::DivDword => {
                self.binary_dword(|a, b| a.checked_div(b).ok_or(EmulationError::DivisionByZero))?;
            }
            ILCode::DivQword => {
                self.binary_qword(|a, b| a.checked_div(b).ok_or(EmulationError::DivisionByZero))?;
            }
            ILCode::RemDword => {
                self.binary_dword(|a, b| a.checked_rem(b).ok_or(EmulationError::DivisionByZero))?;
            }
            ILCode::RemQword => {
                self.binary_qword(|a, b| a.checked_rem(b).ok_or(EmulationError::DivisionByZero))?;
            }
            ILCode::NorDword => self.binary_dword(|a, b| Ok(!(a | b)))?,
            ILCode::NorQword => self.binary_qword(|a, b| Ok(!(a | b)))?,

            ILCode::ShlDword => self.binary_dword(|value, amount| Ok(value << (amount % 32)))?,
            ILCode::ShrDword => self.binary_dword(|value, amount| Ok(value >> (amount % 32)))?,
            ILCode::ShlQword => {
                let amount = self.pop()?.as_u32();
                let value = self.pop()?.as_u64();
                self.stack
                    .push(ConcreteValue::qword(value << (amount % 64)));
            }
            ILCode::ShrQword => {
                let amount = self.pop()?.as_u32();
                let value = self.pop()?.as_u64();
                self.stack
                    .push(ConcreteValue::qword(value >> (amount % 64)));
            }

            code => return Err(EmulationError::NotSupported(code)),
        }
        Ok(())
    }

    /// Pops the right-hand operand first: dependencies are pushed in slot
    /// order, so the stack top is the rightmost operand.
    fn binary_dword(
        &mut self,
        op: impl FnOnce(u32, u32) -> Result<u32, EmulationError>,
    ) -> Result<(), EmulationError> {
        let rhs = self.pop()?.as_u32();
        let lhs = self.pop()?.as_u32();
        self.stack.push(ConcreteValue::dword(op(lhs, rhs)?));
        Ok(())
    }

    fn binary_qword(
        &mut self,
        op: impl FnOnce(u64, u64) -> Result<u64, EmulationError>,
    ) -> Result<(), EmulationError> {
        let rhs = self.pop()?.as_u64();
        let lhs = self.pop()?.as_u64();
        self.stack.push(ConcreteValue::qword(op(lhs, rhs)?));
        Ok(())
    }

    fn pop(&mut self) -> Result<ConcreteValue, EmulationError> {
        self.stack.pop().ok_or(EmulationError::StackUnderflow)
    }
}

#[cfg(test)]
mod tests {
    use devirt_interface::{DecodedInstruction, VmType};

    use super::*;
    use crate::{instruction::Instruction, symbolic::SymbolicValue};

    fn arena(instructions: Vec<Instruction>) -> BTreeMap<u64, Instruction> {
        instructions.into_iter().map(|i| (i.offset, i)).collect()
    }

    fn instr(offset: u64, code: ILCode, operand: Operand) -> Instruction {
        Instruction::from_decoded(DecodedInstruction {
            offset,
            size: 1,
            code,
            operand,
            next_key: 0,
        })
    }

    fn with_deps(mut instruction: Instruction, deps: &[(u32, u64)]) -> Instruction {
        for &(slot, producer) in deps {
            instruction
                .dependencies
                .add_or_merge(slot, SymbolicValue::new(producer, VmType::Unknown));
        }
        instruction
    }

    #[test]
    fn evaluates_an_addition_chain() {
        // 0x10: PUSHI_DWORD 0x30
        // 0x15: PUSHI_DWORD 0x10
        // 0x1a: ADD_DWORD
        let arena = arena(vec![
            instr(0x10, ILCode::PushiDword, Operand::ImmediateDword(0x30)),
            instr(0x15, ILCode::PushiDword, Operand::ImmediateDword(0x10)),
            with_deps(
                instr(0x1a, ILCode::AddDword, Operand::None),
                &[(0, 0x10), (1, 0x15)],
            ),
        ]);

        let value = PartialEmulator::new(&arena).emulate_source(0x1a).unwrap();
        assert_eq!(value.as_u64(), 0x40);
    }

    #[test]
    fn sees_through_register_moves() {
        // PUSHI feeds POP (a register store), whose value PUSHR reloads.
        let arena = arena(vec![
            instr(0x10, ILCode::PushiDword, Operand::ImmediateDword(0x42)),
            with_deps(instr(0x15, ILCode::Pop, Operand::Register(3)), &[(0, 0x10)]),
            with_deps(
                instr(0x16, ILCode::PushrDword, Operand::Register(3)),
                &[(0, 0x15)],
            ),
        ]);

        let value = PartialEmulator::new(&arena).emulate_source(0x16).unwrap();
        assert_eq!(value.as_u64(), 0x42);
    }

    #[test]
    fn sign_extension_widens_correctly() {
        let arena = arena(vec![
            instr(0x10, ILCode::PushiDword, Operand::ImmediateDword(0xFF)),
            with_deps(instr(0x15, ILCode::SxByte, Operand::None), &[(0, 0x10)]),
        ]);

        let value = PartialEmulator::new(&arena).emulate_source(0x15).unwrap();
        assert_eq!(value.as_u32(), u32::MAX);
    }

    #[test]
    fn division_by_zero_is_reported() {
        let arena = arena(vec![
            instr(0x10, ILCode::PushiDword, Operand::ImmediateDword(7)),
            instr(0x15, ILCode::PushiDword, Operand::ImmediateDword(0)),
            with_deps(
                instr(0x1a, ILCode::DivDword, Operand::None),
                &[(0, 0x10), (1, 0x15)],
            ),
        ]);

        assert_eq!(
            PartialEmulator::new(&arena).emulate_source(0x1a),
            Err(EmulationError::DivisionByZero)
        );
    }

    #[test]
    fn unsupported_opcodes_are_rejected() {
        let arena = arena(vec![instr(0x10, ILCode::LindDword, Operand::None)]);
        assert!(matches!(
            PartialEmulator::new(&arena).emulate_source(0x10),
            Err(EmulationError::NotSupported(ILCode::LindDword))
        ));
    }

    #[test]
    fn cycles_are_detected() {
        let arena = arena(vec![with_deps(
            instr(0x10, ILCode::PushrDword, Operand::Register(0)),
            &[(0, 0x10)],
        )]);
        assert_eq!(
            PartialEmulator::new(&arena).emulate_source(0x10),
            Err(EmulationError::Cycle { offset: 0x10 })
        );
    }
}
