//! The `VCALL` sub-dispatcher.
//!
//! `VCALL` is the interpreter's single polymorphic opcode: the first popped
//! value selects a sub-behavior through the resolved selector table, and
//! each sub-behavior declares its own pops over metadata ids and stack
//! operands. The annotation is rewritten to carry the resolved payload so
//! downstream lifting never re-derives it.

use devirt_interface::{
    ECallCode, MemberRef, MetadataImage, MetadataToken, MethodDesc, MethodSignature, TokenKind,
    VCallCode, VmType,
};

use crate::{
    annotation::{VCallAnnotation, VCallKind},
    disasm::ExportDisassembly,
    error::StateError,
    instruction::Instruction,
    state::ProgramState,
    symbolic::SymbolicValue,
};

use super::{infer, pop_value, Context, Step};

const TYPE_TABLES: &[TokenKind] =
    &[TokenKind::TypeDef, TokenKind::TypeRef, TokenKind::TypeSpec];
const METHOD_TABLES: &[TokenKind] = &[
    TokenKind::MethodDef,
    TokenKind::MemberRef,
    TokenKind::MethodSpec,
];
const FIELD_TABLES: &[TokenKind] = &[TokenKind::Field, TokenKind::MemberRef];
const ANY_TABLES: &[TokenKind] = &[
    TokenKind::TypeDef,
    TokenKind::TypeRef,
    TokenKind::TypeSpec,
    TokenKind::MethodDef,
    TokenKind::MemberRef,
    TokenKind::MethodSpec,
    TokenKind::Field,
];

/// Bits of the `ECALL` descriptor dword holding the member-reference id.
const ECALL_ID_MASK: u32 = 0x00FF_FFFF;

pub(super) fn vcall<M: MetadataImage>(
    ctx: &Context<'_, M>,
    record: &mut ExportDisassembly,
    instr: &mut Instruction,
    mut next: ProgramState,
) -> Result<Step, StateError> {
    let at = instr.offset;

    let selector = pop_value(&mut next, at)?;
    instr.dependencies.add_or_merge(0, selector.clone());
    let raw_selector = infer(record, &selector, at)?.as_u8();
    let Some(code) = ctx.constants.vcall(raw_selector) else {
        return Err(StateError::UnsupportedVCall {
            offset: at,
            selector: raw_selector,
        });
    };

    let mut op = VCallOp {
        ctx,
        record,
        instr,
        next_slot: 1,
    };

    let (call, pushes, terminal) = match code {
        VCallCode::Ecall => {
            let descriptor = op.pop_concrete(&mut next, at)? as u32;
            let Some(kind) = ctx.constants.ecall((descriptor >> 24) as u8) else {
                return Err(StateError::UnsupportedECall {
                    offset: at,
                    raw: (descriptor >> 24) as u8,
                });
            };
            let token = op.resolve(at, descriptor & ECALL_ID_MASK, METHOD_TABLES)?;
            let method = op.method(at, token)?;

            let this_arg =
                kind != ECallCode::NewObj && method.signature.is_instance(ctx.constants);
            let argument_count = method.signature.param_count() + usize::from(this_arg);
            for _ in 0..argument_count {
                op.pop_operand(&mut next, at)?;
            }

            let result = if kind == ECallCode::NewObj {
                Some(VmType::Object)
            } else {
                op.member_return_type(at, &method.signature)?
            };
            (
                VCallKind::Ecall {
                    method: token,
                    opcode: kind,
                    returns_value: result.is_some(),
                },
                result,
                false,
            )
        }
        VCallCode::Box => {
            let ty = op.pop_token(&mut next, at, TYPE_TABLES)?;
            op.pop_operand(&mut next, at)?;
            (VCallKind::Box { ty }, Some(VmType::Object), false)
        }
        VCallCode::Unbox => {
            let ty = op.pop_token(&mut next, at, TYPE_TABLES)?;
            op.pop_operand(&mut next, at)?;
            let unboxed = op.type_of(at, ty)?;
            (VCallKind::Unbox { ty }, Some(unboxed), false)
        }
        VCallCode::Cast => {
            let ty = op.pop_token(&mut next, at, TYPE_TABLES)?;
            op.pop_operand(&mut next, at)?;
            (VCallKind::Cast { ty }, Some(VmType::Object), false)
        }
        VCallCode::NewObj => {
            let ctor = op.pop_token(&mut next, at, METHOD_TABLES)?;
            let method = op.method(at, ctor)?;
            for _ in 0..method.signature.param_count() {
                op.pop_operand(&mut next, at)?;
            }
            (VCallKind::NewObj { ctor }, Some(VmType::Object), false)
        }
        VCallCode::LdFld => {
            let field = op.pop_token(&mut next, at, FIELD_TABLES)?;
            op.pop_operand(&mut next, at)?;
            let loaded = op.field_type(at, field)?;
            (VCallKind::LdFld { field }, Some(loaded), false)
        }
        VCallCode::StFld => {
            let field = op.pop_token(&mut next, at, FIELD_TABLES)?;
            op.pop_operand(&mut next, at)?; // value
            op.pop_operand(&mut next, at)?; // object
            (VCallKind::StFld { field }, None, false)
        }
        VCallCode::LdToken => {
            let token = op.pop_token(&mut next, at, ANY_TABLES)?;
            (VCallKind::LdToken { token }, Some(VmType::Object), false)
        }
        VCallCode::Throw => {
            op.pop_operand(&mut next, at)?;
            (VCallKind::Throw, None, true)
        }
        VCallCode::SizeOf => {
            let ty = op.pop_token(&mut next, at, TYPE_TABLES)?;
            (VCallKind::SizeOf { ty }, Some(VmType::Dword), false)
        }
        VCallCode::InitObj => {
            let ty = op.pop_token(&mut next, at, TYPE_TABLES)?;
            op.pop_operand(&mut next, at)?;
            (VCallKind::InitObj { ty }, None, false)
        }
        VCallCode::CkFinite => {
            let checked = op.pop_operand(&mut next, at)?;
            (VCallKind::CkFinite, Some(checked), false)
        }
        VCallCode::LocAlloc => {
            op.pop_operand(&mut next, at)?;
            (VCallKind::LocAlloc, Some(VmType::Ptr), false)
        }
        VCallCode::Break => (VCallKind::Break, None, false),
    };

    let inferred_pop = instr.dependencies.len() as u32;
    let inferred_push = u32::from(pushes.is_some());
    if let Some(ty) = pushes {
        next.stack.push(SymbolicValue::new(at, ty));
    }
    instr.annotation = Some(
        VCallAnnotation {
            inferred_pop,
            inferred_push,
            call,
        }
        .into(),
    );

    if terminal {
        Ok(Step::terminal())
    } else {
        Ok(Step::fall_through(next))
    }
}

/// Pop/record/resolve helpers sharing the running dependency slot counter.
struct VCallOp<'p, 'a, M> {
    ctx: &'p Context<'a, M>,
    record: &'p ExportDisassembly,
    instr: &'p mut Instruction,
    next_slot: u32,
}

impl<M: MetadataImage> VCallOp<'_, '_, M> {
    /// Pops a stack operand and records it; returns its inferred type.
    fn pop_operand(&mut self, next: &mut ProgramState, at: u64) -> Result<VmType, StateError> {
        let value = pop_value(next, at)?;
        let ty = value.ty();
        self.instr.dependencies.add_or_merge(self.next_slot, value);
        self.next_slot += 1;
        Ok(ty)
    }

    /// Pops an operand that must evaluate to a concrete number.
    fn pop_concrete(&mut self, next: &mut ProgramState, at: u64) -> Result<u64, StateError> {
        let value = pop_value(next, at)?;
        self.instr
            .dependencies
            .add_or_merge(self.next_slot, value.clone());
        self.next_slot += 1;
        Ok(infer(self.record, &value, at)?.as_u64())
    }

    /// Pops a concrete reference id and resolves it into `allowed` tables.
    fn pop_token(
        &mut self,
        next: &mut ProgramState,
        at: u64,
        allowed: &[TokenKind],
    ) -> Result<MetadataToken, StateError> {
        let id = self.pop_concrete(next, at)? as u32;
        self.resolve(at, id, allowed)
    }

    fn resolve(
        &self,
        at: u64,
        id: u32,
        allowed: &[TokenKind],
    ) -> Result<MetadataToken, StateError> {
        Ok(self.ctx.image.resolve_reference(at, id, allowed)?)
    }

    fn method(&self, at: u64, token: MetadataToken) -> Result<MethodDesc, StateError> {
        match self.ctx.image.resolve_member(token) {
            Some(MemberRef::Method(method)) => Ok(method),
            _ => Err(StateError::UnexpectedMember { offset: at, token }),
        }
    }

    fn type_of(&self, at: u64, token: MetadataToken) -> Result<VmType, StateError> {
        match self.ctx.image.resolve_member(token) {
            Some(MemberRef::Type(ty)) => Ok(ty.vm_type),
            _ => Err(StateError::UnexpectedMember { offset: at, token }),
        }
    }

    fn field_type(&self, at: u64, token: MetadataToken) -> Result<VmType, StateError> {
        match self.ctx.image.resolve_member(token) {
            Some(MemberRef::Field(field)) => Ok(field.vm_type),
            _ => Err(StateError::UnexpectedMember { offset: at, token }),
        }
    }

    /// Return type of a resolved method, `None` for void.
    fn member_return_type(
        &self,
        at: u64,
        signature: &MethodSignature,
    ) -> Result<Option<VmType>, StateError> {
        match self.ctx.image.resolve_member(signature.return_token) {
            Some(MemberRef::Type(ty)) => Ok((!ty.is_void).then_some(ty.vm_type)),
            _ => Err(StateError::UnexpectedMember {
                offset: at,
                token: signature.return_token,
            }),
        }
    }
}
