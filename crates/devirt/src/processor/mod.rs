//! The per-instruction symbolic transfer function.
//!
//! [`next_states`] consumes one program state and one arena instruction and
//! produces the states execution can continue in. Along the way it records
//! the instruction's data dependencies, annotates its stack effect, and
//! registers every discovered block header on the export record.
//!
//! Calls, returns, protected regions and v-calls have dedicated submodules;
//! everything else flows through the table-driven default path at the
//! bottom of this module.

use std::collections::HashMap;

use tracing::warn;

use devirt_interface::{
    ExportDirectory, FlowControl, ILCode, MetadataImage, Operand, OperandType, PopBehavior,
    PushBehavior, VmConstants, VmRegister, VmType,
};

use crate::{
    annotation::{JumpAnnotation, PlainAnnotation},
    disasm::ExportDisassembly,
    emulator::{concrete_value, ConcreteValue, PartialEmulator},
    error::StateError,
    instruction::Instruction,
    state::ProgramState,
    symbolic::SymbolicValue,
};

mod call;
mod eh;
mod vcall;

/// Read-only collaborators shared by every processor invocation.
#[derive(Debug)]
pub(crate) struct Context<'a, M> {
    pub(crate) constants: &'a VmConstants,
    pub(crate) image: &'a M,
    pub(crate) exports: &'a ExportDirectory,
}

/// What one transfer-function invocation produced.
#[derive(Debug, Default)]
pub(crate) struct Step {
    /// States to schedule next.
    pub(crate) successors: Vec<ProgramState>,
    /// A call site parked until its callee's exit key is known.
    pub(crate) pending: Option<PendingCall>,
}

impl Step {
    fn terminal() -> Self {
        Self::default()
    }

    fn fall_through(next: ProgramState) -> Self {
        Self {
            successors: vec![next],
            pending: None,
        }
    }
}

/// A call site whose continuation is blocked on the callee's exit key.
#[derive(Debug)]
pub(crate) struct PendingCall {
    /// Offset of the blocked `CALL` instruction.
    pub(crate) offset: u64,
    /// Export id of the callee.
    pub(crate) callee: u32,
    /// VM type the callee returns in `R0`, when it returns one.
    pub(crate) result_type: Option<VmType>,
    /// The advanced state, still carrying the wrong (chained) key.
    pub(crate) state: ProgramState,
}

/// Runs the transfer function for `instr` against `state`.
pub(crate) fn next_states<M: MetadataImage>(
    ctx: &Context<'_, M>,
    record: &mut ExportDisassembly,
    exit_keys: &HashMap<u32, u32>,
    state: &ProgramState,
    instr: &mut Instruction,
    next_key: u32,
) -> Result<Step, StateError> {
    let mut next = state.advanced(instr.size, next_key);

    if instr.opcode.affects_flags {
        next.registers.set(
            VmRegister::Fl,
            SymbolicValue::new(instr.offset, VmType::Byte),
        );
    }

    match instr.code() {
        ILCode::Call => call::call(ctx, record, exit_keys, instr, next),
        ILCode::Ret => call::ret(record, instr, next),
        ILCode::Vcall => vcall::vcall(ctx, record, instr, next),
        ILCode::Try => eh::try_begin(ctx, record, instr, next),
        ILCode::Leave => eh::leave(instr, next),
        _ => transfer(ctx, record, instr, next),
    }
}

/// The default pop/push/flow path for table-described opcodes.
fn transfer<M: MetadataImage>(
    ctx: &Context<'_, M>,
    record: &mut ExportDisassembly,
    instr: &mut Instruction,
    mut next: ProgramState,
) -> Result<Step, StateError> {
    let at = instr.offset;

    // Pop phase.
    let inferred_pop = match instr.opcode.pops {
        PopBehavior::None => {
            // Register reads push the register's current symbolic value, so
            // the dependency chain stays transparent to the emulator. The
            // value itself is attached in the push phase below.
            0
        }
        PopBehavior::Fixed(slots) => {
            let mut popped = Vec::with_capacity(slots.len());
            for &slot_type in slots {
                let mut value = pop_value(&mut next, at)?;
                if slot_type != VmType::Unknown {
                    value.assign_type(slot_type);
                }
                popped.push(value);
            }

            // A register operand on a popping opcode is a register store.
            if instr.opcode.operand_type == OperandType::Register {
                let register = register_operand(ctx, instr)?;
                next.registers
                    .set(register, SymbolicValue::new(at, popped[0].ty()));
            }

            // Slot 0 is the leftmost operand, i.e. the last value popped.
            let count = popped.len();
            for (index, value) in popped.into_iter().rev().enumerate() {
                instr.dependencies.add_or_merge(index as u32, value);
            }
            count as u32
        }
        PopBehavior::Var => {
            return Err(StateError::Internal {
                offset: at,
                message: "variable-pop opcode reached the default path",
            })
        }
    };

    // Push phase.
    let inferred_push = match instr.opcode.pushes {
        PushBehavior::None => 0,
        PushBehavior::One(ty) => {
            let value = if instr.opcode.operand_type == OperandType::Register
                && matches!(instr.opcode.pops, PopBehavior::None)
            {
                // Register read: forward the register's value when a tracked
                // path wrote it, otherwise start a fresh chain here.
                let register = register_operand(ctx, instr)?;
                match next.registers.get(register) {
                    Some(current) => {
                        let mut value = current.clone();
                        value.assign_type(ty);
                        value
                    }
                    None => SymbolicValue::new(at, ty),
                }
            } else {
                SymbolicValue::new(at, ty)
            };
            next.stack.push(value);
            1
        }
        PushBehavior::Var => {
            return Err(StateError::Internal {
                offset: at,
                message: "variable-push opcode reached the default path",
            })
        }
    };

    // Flow phase.
    match instr.opcode.flow_control {
        FlowControl::Next => {
            instr.annotation = Some(
                PlainAnnotation {
                    inferred_pop,
                    inferred_push,
                }
                .into(),
            );
            Ok(Step::fall_through(next))
        }
        FlowControl::Jump => {
            // The instruction after an unconditional jump starts a new
            // block even though control never falls through to it.
            record.block_headers.insert(next.ip);
            let targets = infer_jump_targets(record, instr)?;
            instr.annotation = Some(
                JumpAnnotation {
                    inferred_pop,
                    inferred_push,
                    inferred_targets: targets.clone(),
                }
                .into(),
            );
            match targets.first() {
                Some(&target) => {
                    next.ip = target;
                    record.block_headers.insert(target);
                    Ok(Step::fall_through(next))
                }
                None => Ok(Step::terminal()),
            }
        }
        FlowControl::ConditionalJump => {
            let targets = if let Operand::SwitchTable(table) = &instr.operand {
                table.clone()
            } else {
                infer_jump_targets(record, instr)?
            };
            instr.annotation = Some(
                JumpAnnotation {
                    inferred_pop,
                    inferred_push,
                    inferred_targets: targets.clone(),
                }
                .into(),
            );

            let mut step = Step::default();
            for &target in &targets {
                record.block_headers.insert(target);
                step.successors.push(next.branched(target));
            }
            record.block_headers.insert(next.ip);
            step.successors.push(next);
            Ok(step)
        }
        FlowControl::Call | FlowControl::Return => Err(StateError::Internal {
            offset: at,
            message: "call-class opcode reached the default path",
        }),
    }
}

/// Resolves the targets of a branch from its last dependency slot: one
/// concrete value per data source, each computed by a fresh emulator run.
/// Inference failures degrade to an empty target list with a warning.
fn infer_jump_targets(
    record: &ExportDisassembly,
    instr: &Instruction,
) -> Result<Vec<u64>, StateError> {
    let Some((_, address)) = instr.dependencies.last() else {
        return Err(StateError::Internal {
            offset: instr.offset,
            message: "branch with no recorded address dependency",
        });
    };

    let mut targets = Vec::new();
    for source in address.sources() {
        let target = match PartialEmulator::new(&record.instructions).emulate_source(source) {
            Ok(value) => value.as_u64(),
            Err(error) => {
                warn!(
                    "leaving branch at {:#x} unresolved: {error}",
                    instr.offset
                );
                return Ok(Vec::new());
            }
        };
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
    Ok(targets)
}

/// Pops one symbolic value, surfacing underflow with the popping offset.
pub(crate) fn pop_value(state: &mut ProgramState, offset: u64) -> Result<SymbolicValue, StateError> {
    state
        .stack
        .pop()
        .ok_or(StateError::StackUnderflow { offset })
}

/// Concretely evaluates a symbolic value against the export's arena.
pub(crate) fn infer(
    record: &ExportDisassembly,
    value: &SymbolicValue,
    offset: u64,
) -> Result<ConcreteValue, StateError> {
    concrete_value(&record.instructions, value)
        .map_err(|source| StateError::Inference { offset, source })
}

/// Maps the instruction's raw register operand through the constants table.
fn register_operand<M>(ctx: &Context<'_, M>, instr: &Instruction) -> Result<VmRegister, StateError> {
    let Operand::Register(raw) = instr.operand else {
        return Err(StateError::Internal {
            offset: instr.offset,
            message: "register opcode without register operand",
        });
    };
    ctx.constants
        .register(raw)
        .ok_or(StateError::Internal {
            offset: instr.offset,
            message: "register byte missing from the constants table",
        })
}
