//! End-to-end scenarios over assembled instruction streams.

use std::collections::BTreeMap;

use devirt_interface::{
    ExportDirectory, MetadataToken, MethodSignature, VmConstants, VmExport, VmType,
};

use crate::{
    testonly::{test_constants, Assembler, StreamDecoder, TestImage, FLAG_INSTANCE},
    Disassembler, ExportDisassembly, StackEffect,
};

mod jumps;
mod vcalls;

/// Well-known type tokens every scenario image carries.
pub(crate) struct Tokens {
    pub(crate) void: MetadataToken,
    pub(crate) int32: MetadataToken,
    #[allow(dead_code)]
    pub(crate) object: MetadataToken,
}

pub(crate) fn base_image() -> (TestImage, Tokens) {
    let mut image = TestImage::new();
    let tokens = Tokens {
        void: image.add_type(0x0100_0001, VmType::Unknown, true),
        int32: image.add_type(0x0100_0002, VmType::Dword, false),
        object: image.add_type(0x0100_0003, VmType::Object, false),
    };
    (image, tokens)
}

pub(crate) fn static_sig(tokens: &Tokens, params: usize, return_token: MetadataToken) -> MethodSignature {
    MethodSignature {
        flags: 0,
        param_tokens: vec![tokens.int32; params],
        return_token,
    }
}

pub(crate) fn instance_sig(
    tokens: &Tokens,
    params: usize,
    return_token: MetadataToken,
) -> MethodSignature {
    MethodSignature {
        flags: FLAG_INSTANCE,
        param_tokens: vec![tokens.int32; params],
        return_token,
    }
}

pub(crate) fn export(id: u32, entry_offset: u64, entry_key: u32, signature: MethodSignature) -> VmExport {
    VmExport {
        id,
        entry_offset,
        entry_key,
        signature,
    }
}

/// One assembled scenario, owning every collaborator the driver borrows.
pub(crate) struct Setup {
    pub(crate) constants: VmConstants,
    pub(crate) image: TestImage,
    pub(crate) decoder: StreamDecoder,
    pub(crate) exports: ExportDirectory,
}

impl Setup {
    pub(crate) fn new(
        image: TestImage,
        assembler: Assembler,
        exports: Vec<VmExport>,
    ) -> Self {
        let constants = test_constants();
        let decoder = assembler.into_decoder(&constants);
        Self {
            constants,
            image,
            decoder,
            exports: ExportDirectory::from_exports(exports),
        }
    }

    pub(crate) fn disassembler(&self) -> Disassembler<'_, StreamDecoder, TestImage> {
        Disassembler::new(&self.decoder, &self.image, &self.constants, &self.exports).unwrap()
    }

    /// Runs to the fixed point and returns the records.
    pub(crate) fn run(&self) -> BTreeMap<u32, ExportDisassembly> {
        let mut disassembler = self.disassembler();
        disassembler.run().unwrap();
        let records = disassembler.into_exports();
        for record in records.values() {
            assert_annotation_invariants(record);
        }
        records
    }
}

/// Every annotated instruction records exactly as many dependencies as it
/// pops.
pub(crate) fn assert_annotation_invariants(record: &ExportDisassembly) {
    for instr in record.instructions.values() {
        if let Some(annotation) = &instr.annotation {
            assert_eq!(
                annotation.inferred_pop() as usize,
                instr.dependencies.len(),
                "pop count diverges from dependencies at {:#x}",
                instr.offset
            );
        }
    }
}
