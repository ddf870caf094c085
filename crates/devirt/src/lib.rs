//! # Inference-Driven Devirtualizing Disassembler
//!
//! This crate recovers the control-flow graph, stack effects and data
//! dependencies of functions that a stack-VM obfuscator compiled into its
//! own encrypted instruction stream.
//!
//! The centerpiece is the [`Disassembler`]: a fixed-point worklist that
//! symbolically executes every exported function, chasing the stream-cipher
//! key that chains consecutive basic blocks together. Concrete addresses
//! (jump targets, call targets, metadata ids) are recovered on demand by a
//! partial emulator running over the reconstructed data-dependency graph.
//!
//! External collaborators — the constants resolver, the raw instruction
//! decoder and the metadata image — are consumed through the contracts in
//! [`devirt_interface`], re-exported here as [`interface`].

pub use devirt_interface as interface;

pub use self::{
    annotation::{
        Annotation, CallAnnotation, JumpAnnotation, PlainAnnotation, StackEffect, VCallAnnotation,
        VCallKind,
    },
    disasm::{Disassembler, ExportDisassembly},
    emulator::EmulationError,
    error::{DisasmError, StateError},
    instruction::{Dependencies, Instruction},
    state::{EhFrame, ProgramState, RegisterFile},
    symbolic::{SymbolicStack, SymbolicValue},
};

mod annotation;
mod disasm;
mod emulator;
mod error;
mod instruction;
mod processor;
mod state;
mod symbolic;
pub mod testonly;
#[cfg(test)]
mod tests;
