//! Unconditional and conditional branches.

use devirt_interface::{ILCode, Operand, VmRegister};
use pretty_assertions::assert_eq;

use crate::{testonly, Annotation};

use super::{base_image, export, static_sig, Setup};

const ENTRY_KEY: u32 = 0x1234_5678;

#[test]
fn unconditional_jump_to_a_constant_address() {
    let (image, tokens) = base_image();
    let constants = testonly::test_constants();
    let mut asm = testonly::Assembler::new(&constants, 0x10);

    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(0x40));
    let jmp = asm.emit(ILCode::Jmp, Operand::None);
    let fall_through = asm.here();
    asm.pad_to(0x40);
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(0));
    let ret = asm.emit(ILCode::Ret, Operand::None);

    let setup = Setup::new(
        image,
        asm,
        vec![export(1, 0x10, ENTRY_KEY, static_sig(&tokens, 0, tokens.void))],
    );
    let records = setup.run();
    let record = &records[&1];

    let Some(Annotation::Jump(annotation)) = &record.instructions[&jmp].annotation else {
        panic!("JMP should carry a jump annotation");
    };
    assert_eq!(annotation.inferred_targets, vec![0x40]);

    assert!(record.block_headers.contains(&0x40));
    assert!(record.block_headers.contains(&fall_through));
    // The successor chain crossed the jump and reached the RET.
    assert!(record.instructions.contains_key(&ret));
    assert!(record.exit_key.is_some());
    // Nothing decoded the padding.
    assert!(!record.instructions.contains_key(&fall_through));
}

#[test]
fn conditional_jump_analyzes_both_arms_and_merges_at_the_join() {
    let (image, tokens) = base_image();
    let constants = testonly::test_constants();
    let mut asm = testonly::Assembler::new(&constants, 0x10);

    // Both arms store into R1, then meet at a join block that reads it.
    let join = 0x60;
    let arm_b = 0x40;

    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(7)); // predicate
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(arm_b as u32));
    let jz = asm.emit(ILCode::Jz, Operand::None);
    let fall_through = asm.here();

    // Arm A (fall-through).
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(1));
    let store_a = asm.emit(ILCode::Pop, testonly::reg(VmRegister::R1));
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(join as u32));
    asm.emit(ILCode::Jmp, Operand::None);

    // Arm B.
    asm.pad_to(arm_b);
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(2));
    let store_b = asm.emit(ILCode::Pop, testonly::reg(VmRegister::R1));
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(join as u32));
    asm.emit(ILCode::Jmp, Operand::None);

    // Join block.
    asm.pad_to(join);
    asm.emit(ILCode::PushrDword, testonly::reg(VmRegister::R1));
    let ret = asm.emit(ILCode::Ret, Operand::None);

    let setup = Setup::new(
        image,
        asm,
        vec![export(1, 0x10, ENTRY_KEY, static_sig(&tokens, 0, tokens.int32))],
    );
    let records = setup.run();
    let record = &records[&1];

    let Some(Annotation::Jump(annotation)) = &record.instructions[&jz].annotation else {
        panic!("JZ should carry a jump annotation");
    };
    assert_eq!(annotation.inferred_targets, vec![arm_b]);
    for header in [arm_b, fall_through, join] {
        assert!(record.block_headers.contains(&header), "{header:#x}");
    }

    // The join-point register read unions the data sources of both stores.
    let sources: Vec<u64> = record.instructions[&ret]
        .dependencies
        .get(0)
        .unwrap()
        .sources()
        .collect();
    assert_eq!(sources, vec![store_a, store_b]);
}

#[test]
fn switch_tables_fan_out_per_entry() {
    let (image, tokens) = base_image();
    let constants = testonly::test_constants();
    let mut asm = testonly::Assembler::new(&constants, 0x10);

    let case_a = 0x40;
    let case_b = 0x50;
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(1)); // index
    let swt = asm.emit(ILCode::Swt, Operand::SwitchTable(vec![case_a, case_b]));
    let fall_through = asm.here();
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(0));
    asm.emit(ILCode::Ret, Operand::None);

    asm.pad_to(case_a);
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(0));
    asm.emit(ILCode::Ret, Operand::None);

    asm.pad_to(case_b);
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(0));
    asm.emit(ILCode::Ret, Operand::None);

    let setup = Setup::new(
        image,
        asm,
        vec![export(1, 0x10, ENTRY_KEY, static_sig(&tokens, 0, tokens.void))],
    );
    let records = setup.run();
    let record = &records[&1];

    let Some(Annotation::Jump(annotation)) = &record.instructions[&swt].annotation else {
        panic!("SWT should carry a jump annotation");
    };
    assert_eq!(annotation.inferred_targets, vec![case_a, case_b]);
    for header in [case_a, case_b, fall_through] {
        assert!(record.block_headers.contains(&header), "{header:#x}");
    }
    // All three arms were decoded.
    assert!(record.instructions.contains_key(&case_a));
    assert!(record.instructions.contains_key(&case_b));
    assert!(record.instructions.contains_key(&fall_through));
}

#[test]
fn unresolvable_targets_degrade_to_a_warning() {
    let (image, tokens) = base_image();
    let constants = testonly::test_constants();
    let mut asm = testonly::Assembler::new(&constants, 0x10);

    // The branch target flows through a heap load the emulator refuses.
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(0x40));
    asm.emit(ILCode::Fp, Operand::None);
    asm.emit(ILCode::LindDword, Operand::None);
    asm.emit(ILCode::Fp, Operand::None);
    let jmp = asm.emit(ILCode::Jmp, Operand::None);

    let setup = Setup::new(
        image,
        asm,
        vec![export(1, 0x10, ENTRY_KEY, static_sig(&tokens, 0, tokens.void))],
    );
    let records = setup.run();
    let record = &records[&1];

    let Some(Annotation::Jump(annotation)) = &record.instructions[&jmp].annotation else {
        panic!("JMP should still be annotated");
    };
    assert!(annotation.inferred_targets.is_empty());
    // The jump never produced successors, so no exit key was pinned.
    assert_eq!(record.exit_key, None);
}
