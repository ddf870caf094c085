//! Decoded instructions and their inferred data dependencies.

use std::collections::{btree_map, BTreeMap};
use std::fmt;

use devirt_interface::{DecodedInstruction, ILCode, OpCode, Operand};

use crate::{annotation::Annotation, symbolic::SymbolicValue};

/// One instruction in a per-export arena.
///
/// The decoded shape (`offset`, `size`, `opcode`, `operand`) is fixed; the
/// `dependencies` and `annotation` fields accumulate as inference visits the
/// instruction, possibly from several program states.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Offset the instruction was decoded at.
    pub offset: u64,
    /// Stream bytes occupied.
    pub size: u8,
    /// Static opcode descriptor.
    pub opcode: &'static OpCode,
    /// Inline operand.
    pub operand: Operand,
    /// Inferred data dependencies, one slot per popped operand.
    pub dependencies: Dependencies,
    /// Inferred stack effect and control-flow annotation.
    pub annotation: Option<Annotation>,
}

impl Instruction {
    /// Wraps a freshly decoded instruction with empty inference state.
    pub fn from_decoded(decoded: DecodedInstruction) -> Self {
        Self {
            offset: decoded.offset,
            size: decoded.size,
            opcode: decoded.code.op(),
            operand: decoded.operand,
            dependencies: Dependencies::default(),
            annotation: None,
        }
    }

    /// The logical opcode.
    pub fn code(&self) -> ILCode {
        self.opcode.code
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}  {:<12}", self.offset, self.code().mnemonic())?;
        if self.operand != Operand::None {
            write!(f, " {}", self.operand)?;
        }
        Ok(())
    }
}

/// Ordered mapping from dependency slot to the symbolic value consumed
/// there. Slot 0 is the instruction's leftmost operand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dependencies(BTreeMap<u32, SymbolicValue>);

impl Dependencies {
    /// Records `value` at `slot`, merging into the slot's existing value
    /// when another path already populated it.
    pub fn add_or_merge(&mut self, slot: u32, value: SymbolicValue) {
        match self.0.entry(slot) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(value);
            }
            btree_map::Entry::Occupied(entry) => entry.into_mut().merge(&value),
        }
    }

    /// The value at `slot`, if populated.
    pub fn get(&self, slot: u32) -> Option<&SymbolicValue> {
        self.0.get(&slot)
    }

    /// The highest populated slot and its value. Branch instructions keep
    /// their target address there.
    pub fn last(&self) -> Option<(u32, &SymbolicValue)> {
        self.0.iter().next_back().map(|(slot, value)| (*slot, value))
    }

    /// Number of populated slots.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no slot is populated.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &SymbolicValue)> {
        self.0.iter().map(|(slot, value)| (*slot, value))
    }
}
