use divan::{black_box, Bencher};
use devirt::{
    testonly::{test_constants, Assembler, TestImage},
    Disassembler,
};
use devirt_interface::{ExportDirectory, ILCode, MethodSignature, Operand, VmExport, VmType};

/// Disassembles one long straight-line export end to end.
#[divan::bench(args = [64, 512, 4096])]
fn straight_line(bencher: Bencher, instructions: u32) {
    let constants = test_constants();

    let mut image = TestImage::new();
    let void = image.add_type(0x0100_0001, VmType::Unknown, true);

    let mut asm = Assembler::new(&constants, 0x10);
    asm.emit(ILCode::PushiDword, Operand::ImmediateDword(1));
    for _ in 0..instructions {
        asm.emit(ILCode::PushiDword, Operand::ImmediateDword(1));
        asm.emit(ILCode::AddDword, Operand::None);
    }
    asm.emit(ILCode::Ret, Operand::None);
    let decoder = asm.into_decoder(&constants);

    let exports = ExportDirectory::from_exports([VmExport {
        id: 1,
        entry_offset: 0x10,
        entry_key: 0xAAAA_AAAA,
        signature: MethodSignature {
            flags: 0,
            param_tokens: vec![],
            return_token: void,
        },
    }]);

    bencher.bench(|| {
        let mut disassembler =
            Disassembler::new(&decoder, &image, &constants, &exports).unwrap();
        disassembler.run().unwrap();
        black_box(disassembler.export(1).unwrap().instructions.len())
    });
}

fn main() {
    divan::main();
}
