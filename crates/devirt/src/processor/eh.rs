//! `TRY` and `LEAVE` handling.
//!
//! Protected regions are pushed onto the state's handler stack when a `TRY`
//! opens them and popped by the matching `LEAVE`. Handler and filter blocks
//! are independent entry points: the interpreter always enters them with a
//! zeroed cipher key, so the processor seeds them as such.

use devirt_interface::{EhType, MetadataImage, TokenKind};

use crate::{
    annotation::PlainAnnotation,
    disasm::ExportDisassembly,
    error::StateError,
    instruction::Instruction,
    state::{EhFrame, ProgramState},
};

use super::{infer, pop_value, Context, Step};

/// Key every handler and filter block starts with.
const HANDLER_ENTRY_KEY: u32 = 0;

const CATCH_TYPE_TABLES: &[TokenKind] =
    &[TokenKind::TypeDef, TokenKind::TypeRef, TokenKind::TypeSpec];

pub(super) fn try_begin<M: MetadataImage>(
    ctx: &Context<'_, M>,
    record: &mut ExportDisassembly,
    instr: &mut Instruction,
    mut next: ProgramState,
) -> Result<Step, StateError> {
    let at = instr.offset;

    let type_value = pop_value(&mut next, at)?;
    instr.dependencies.add_or_merge(0, type_value.clone());
    let raw_type = infer(record, &type_value, at)?.as_u8();
    let frame_type = next_eh_type(ctx, raw_type, at)?;

    let mut catch_type = None;
    let mut filter_address = 0;
    let mut slot = 1;
    match frame_type {
        EhType::Catch => {
            let value = pop_value(&mut next, at)?;
            instr.dependencies.add_or_merge(slot, value.clone());
            slot += 1;
            let id = infer(record, &value, at)?.as_u32();
            catch_type = Some(ctx.image.resolve_reference(at, id, CATCH_TYPE_TABLES)?);
        }
        EhType::Filter => {
            let value = pop_value(&mut next, at)?;
            instr.dependencies.add_or_merge(slot, value.clone());
            slot += 1;
            filter_address = infer(record, &value, at)?.as_u64();
        }
        EhType::Finally => {}
        EhType::Fault => return Err(StateError::UnsupportedFault { offset: at }),
    }

    let handler_value = pop_value(&mut next, at)?;
    instr.dependencies.add_or_merge(slot, handler_value.clone());
    let handler_address = infer(record, &handler_value, at)?.as_u64();

    instr.annotation = Some(
        PlainAnnotation {
            inferred_pop: instr.dependencies.len() as u32,
            inferred_push: 0,
        }
        .into(),
    );

    next.eh_stack.push(EhFrame {
        frame_type,
        try_start: next.ip,
        handler_address,
        filter_address,
        catch_type,
    });

    let mut handler_entry = next.branched(handler_address);
    handler_entry.key = HANDLER_ENTRY_KEY;
    record.block_headers.insert(handler_address);

    let mut step = Step::fall_through(next);
    step.successors.push(handler_entry);

    if frame_type == EhType::Filter {
        let mut filter_entry = step.successors[0].branched(filter_address);
        filter_entry.key = HANDLER_ENTRY_KEY;
        record.block_headers.insert(filter_address);
        step.successors.push(filter_entry);
    }

    Ok(step)
}

fn next_eh_type<M>(ctx: &Context<'_, M>, raw: u8, at: u64) -> Result<EhType, StateError> {
    ctx.constants
        .eh_type(raw)
        .ok_or(StateError::UnknownEhType { offset: at, raw })
}

pub(super) fn leave(instr: &mut Instruction, mut next: ProgramState) -> Result<Step, StateError> {
    let at = instr.offset;

    // The marker is a consistency token the interpreter checks at runtime;
    // inference only records the dependency.
    let marker = pop_value(&mut next, at)?;
    instr.dependencies.add_or_merge(0, marker);

    if next.eh_stack.pop().is_none() {
        return Err(StateError::Internal {
            offset: at,
            message: "LEAVE outside any protected region",
        });
    }

    instr.annotation = Some(
        PlainAnnotation {
            inferred_pop: 1,
            inferred_push: 0,
        }
        .into(),
    );
    Ok(Step::fall_through(next))
}
