//! The polymorphic `VCALL` opcode.

use devirt_interface::{ECallCode, ILCode, Operand, VCallCode, VmType};
use pretty_assertions::assert_eq;

use crate::{testonly, Annotation, StackEffect, VCallKind};

use super::{base_image, export, static_sig, Setup};

const ENTRY_KEY: u32 = 0x0BAD_F00D;

fn selector(code: VCallCode) -> Operand {
    Operand::ImmediateDword(testonly::vcall_selector(code))
}

#[test]
fn ecall_resolves_the_method_and_its_arguments() {
    let (mut image, tokens) = base_image();
    let method_sig = static_sig(&tokens, 1, tokens.int32);
    let method = image.add_method(0x0A00_0001, method_sig);
    image.map_reference(5, method);

    let constants = testonly::test_constants();
    let mut asm = testonly::Assembler::new(&constants, 0x10);
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(42)); // argument
    asm.emit(
        ILCode::PushiDword,
        Operand::ImmediateDword(testonly::ecall_descriptor(ECallCode::Call, 5)),
    );
    asm.emit(ILCode::PushiDword, selector(VCallCode::Ecall));
    let vcall = asm.emit(ILCode::Vcall, Operand::None);
    asm.emit(ILCode::Ret, Operand::None);

    let setup = Setup::new(
        image,
        asm,
        vec![export(1, 0x10, ENTRY_KEY, static_sig(&tokens, 0, tokens.int32))],
    );
    let records = setup.run();
    let record = &records[&1];

    let Some(Annotation::VCall(annotation)) = &record.instructions[&vcall].annotation else {
        panic!("VCALL should carry a v-call annotation");
    };
    assert_eq!(
        annotation.call,
        VCallKind::Ecall {
            method,
            opcode: ECallCode::Call,
            returns_value: true,
        }
    );
    // Selector, descriptor and one argument in; one result out.
    assert_eq!(annotation.inferred_pop(), 3);
    assert_eq!(annotation.inferred_push(), 1);
    // The RET consumed the pushed result.
    assert!(record.exit_key.is_some());
}

#[test]
fn box_rewrites_the_annotation_and_pushes_an_object() {
    let (mut image, tokens) = base_image();
    image.map_reference(9, tokens.int32);

    let constants = testonly::test_constants();
    let mut asm = testonly::Assembler::new(&constants, 0x10);
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(123)); // value
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(9)); // type id
    asm.emit(ILCode::PushiDword, selector(VCallCode::Box));
    let vcall = asm.emit(ILCode::Vcall, Operand::None);
    asm.emit(ILCode::Ret, Operand::None);

    let setup = Setup::new(
        image,
        asm,
        vec![export(1, 0x10, ENTRY_KEY, static_sig(&tokens, 0, tokens.void))],
    );
    let records = setup.run();
    let record = &records[&1];

    let Some(Annotation::VCall(annotation)) = &record.instructions[&vcall].annotation else {
        panic!("VCALL should carry a v-call annotation");
    };
    assert_eq!(annotation.call, VCallKind::Box { ty: tokens.int32 });
    assert_eq!(annotation.inferred_pop(), 3);
    assert_eq!(annotation.inferred_push(), 1);

    // The boxed result is what the RET popped.
    let ret_offset = *record
        .instructions
        .iter()
        .find(|(_, instr)| instr.code() == ILCode::Ret)
        .unwrap()
        .0;
    let popped = record.instructions[&ret_offset].dependencies.get(0).unwrap();
    assert_eq!(popped.sources().collect::<Vec<_>>(), vec![vcall]);
}

#[test]
fn field_loads_take_their_type_from_the_field() {
    let (mut image, tokens) = base_image();
    let field = image.add_field(0x0400_0007, VmType::Qword);
    image.map_reference(11, field);

    let constants = testonly::test_constants();
    let mut asm = testonly::Assembler::new(&constants, 0x10);
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(0)); // object
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(11)); // field id
    asm.emit(ILCode::PushiDword, selector(VCallCode::LdFld));
    let vcall = asm.emit(ILCode::Vcall, Operand::None);
    asm.emit(ILCode::Ret, Operand::None);

    let setup = Setup::new(
        image,
        asm,
        vec![export(1, 0x10, ENTRY_KEY, static_sig(&tokens, 0, tokens.void))],
    );
    let records = setup.run();
    let record = &records[&1];

    let Some(Annotation::VCall(annotation)) = &record.instructions[&vcall].annotation else {
        panic!("VCALL should carry a v-call annotation");
    };
    assert_eq!(annotation.call, VCallKind::LdFld { field });

    let ret_offset = *record
        .instructions
        .iter()
        .find(|(_, instr)| instr.code() == ILCode::Ret)
        .unwrap()
        .0;
    let popped = record.instructions[&ret_offset].dependencies.get(0).unwrap();
    assert_eq!(popped.ty(), VmType::Qword);
}

#[test]
fn throw_terminates_the_state() {
    let (image, tokens) = base_image();
    let constants = testonly::test_constants();
    let mut asm = testonly::Assembler::new(&constants, 0x10);
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(0)); // exception
    asm.emit(ILCode::PushiDword, selector(VCallCode::Throw));
    let vcall = asm.emit(ILCode::Vcall, Operand::None);
    let unreachable = asm.emit(ILCode::Ret, Operand::None);

    let setup = Setup::new(
        image,
        asm,
        vec![export(1, 0x10, ENTRY_KEY, static_sig(&tokens, 0, tokens.void))],
    );
    let records = setup.run();
    let record = &records[&1];

    let Some(Annotation::VCall(annotation)) = &record.instructions[&vcall].annotation else {
        panic!("VCALL should carry a v-call annotation");
    };
    assert_eq!(annotation.call, VCallKind::Throw);
    assert!(!record.instructions.contains_key(&unreachable));
    assert_eq!(record.exit_key, None);
}

#[test]
fn unmapped_selectors_are_recorded_unresolved() {
    let (image, tokens) = base_image();
    let constants = testonly::test_constants();
    let mut asm = testonly::Assembler::new(&constants, 0x10);
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(0xEE));
    let vcall = asm.emit(ILCode::Vcall, Operand::None);
    asm.emit(ILCode::Ret, Operand::None);

    let setup = Setup::new(
        image,
        asm,
        vec![export(1, 0x10, ENTRY_KEY, static_sig(&tokens, 0, tokens.void))],
    );
    let records = setup.run();
    let record = &records[&1];

    assert_eq!(
        record.unresolved_offsets.iter().copied().collect::<Vec<_>>(),
        vec![vcall]
    );
    assert_eq!(record.exit_key, None);
}

#[test]
fn sizeof_needs_no_stack_operands() {
    let (mut image, tokens) = base_image();
    image.map_reference(3, tokens.int32);

    let constants = testonly::test_constants();
    let mut asm = testonly::Assembler::new(&constants, 0x10);
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(3)); // type id
    asm.emit(ILCode::PushiDword, selector(VCallCode::SizeOf));
    let vcall = asm.emit(ILCode::Vcall, Operand::None);
    asm.emit(ILCode::Ret, Operand::None);

    let setup = Setup::new(
        image,
        asm,
        vec![export(1, 0x10, ENTRY_KEY, static_sig(&tokens, 0, tokens.void))],
    );
    let records = setup.run();
    let record = &records[&1];

    let Some(Annotation::VCall(annotation)) = &record.instructions[&vcall].annotation else {
        panic!("VCALL should carry a v-call annotation");
    };
    assert_eq!(annotation.call, VCallKind::SizeOf { ty: tokens.int32 });
    assert_eq!(annotation.inferred_pop(), 2);
    assert_eq!(annotation.inferred_push(), 1);
}
