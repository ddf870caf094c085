//! `CALL` and `RET` handling.
//!
//! Calls are the reason disassembly needs a fixed point: the cipher key
//! valid after a call is whatever key the callee's own stream ends on, so a
//! call site cannot be crossed until some path through the callee has
//! reached a `RET` and pinned that exit key.

use std::collections::HashMap;

use tracing::{debug, warn};

use devirt_interface::{MemberRef, MetadataImage, MethodSignature, VmRegister, VmType};

use crate::{
    annotation::{CallAnnotation, PlainAnnotation},
    disasm::ExportDisassembly,
    error::StateError,
    instruction::Instruction,
    state::ProgramState,
    symbolic::SymbolicValue,
};

use super::{infer, pop_value, Context, PendingCall, Step};

pub(super) fn call<M: MetadataImage>(
    ctx: &Context<'_, M>,
    record: &mut ExportDisassembly,
    exit_keys: &HashMap<u32, u32>,
    instr: &mut Instruction,
    mut next: ProgramState,
) -> Result<Step, StateError> {
    let at = instr.offset;

    let target = pop_value(&mut next, at)?;
    instr.dependencies.add_or_merge(0, target.clone());
    let address = infer(record, &target, at)?.as_u64();

    let Some(callee) = ctx.exports.by_entry_offset(address) else {
        return Err(StateError::UnsupportedCall {
            offset: at,
            address,
        });
    };
    let callee_id = callee.id;
    let signature = callee.signature.clone();

    // Arguments sit under the target, rightmost on top; `this` (for
    // instance signatures) was pushed before all of them.
    let mut arguments = Vec::with_capacity(signature.param_count() + 1);
    for _ in 0..signature.param_count() {
        arguments.push(pop_value(&mut next, at)?);
    }
    if signature.is_instance(ctx.constants) {
        arguments.push(pop_value(&mut next, at)?);
    }
    arguments.reverse();
    for (index, value) in arguments.into_iter().enumerate() {
        instr.dependencies.add_or_merge(index as u32 + 1, value);
    }

    let result_type = return_type(ctx, &signature, at)?;
    instr.annotation = Some(
        CallAnnotation {
            inferred_pop: instr.dependencies.len() as u32,
            inferred_push: 0,
            address,
            callee: callee_id,
            signature,
            returns_value: result_type.is_some(),
        }
        .into(),
    );

    match exit_keys.get(&callee_id) {
        None => {
            // Park the advanced state; the driver re-seeds it once some
            // path through the callee pins the exit key.
            record.unresolved_offsets.insert(at);
            Ok(Step {
                successors: Vec::new(),
                pending: Some(PendingCall {
                    offset: at,
                    callee: callee_id,
                    result_type,
                    state: next,
                }),
            })
        }
        Some(&exit_key) => {
            record.unresolved_offsets.remove(&at);
            next.key = exit_key;
            if let Some(ty) = result_type {
                next.registers.set(VmRegister::R0, SymbolicValue::new(at, ty));
            }
            Ok(Step::fall_through(next))
        }
    }
}

/// VM type of the callee's return value, `None` for void.
fn return_type<M: MetadataImage>(
    ctx: &Context<'_, M>,
    signature: &MethodSignature,
    at: u64,
) -> Result<Option<VmType>, StateError> {
    match ctx.image.resolve_member(signature.return_token) {
        Some(MemberRef::Type(ty)) => Ok((!ty.is_void).then_some(ty.vm_type)),
        _ => Err(StateError::UnexpectedMember {
            offset: at,
            token: signature.return_token,
        }),
    }
}

pub(super) fn ret(
    record: &mut ExportDisassembly,
    instr: &mut Instruction,
    mut next: ProgramState,
) -> Result<Step, StateError> {
    let at = instr.offset;

    // The return address is popped but never evaluated; nothing consumes it.
    let return_address = pop_value(&mut next, at)?;
    instr.dependencies.add_or_merge(0, return_address);

    match record.exit_key {
        None => {
            record.exit_key = Some(next.key);
            debug!(
                "export {}: exit key {:#010x} pinned by RET at {at:#x}",
                record.export.id, next.key
            );
        }
        Some(exit_key) if exit_key != next.key => {
            warn!(
                "export {}: RET at {at:#x} reaches key {:#010x}, but the exit key was pinned to {exit_key:#010x}",
                record.export.id, next.key
            );
        }
        Some(_) => {}
    }

    instr.annotation = Some(
        PlainAnnotation {
            inferred_pop: 1,
            inferred_push: 0,
        }
        .into(),
    );
    Ok(Step::terminal())
}
