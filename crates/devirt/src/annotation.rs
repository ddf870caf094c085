//! Inference annotations attached to instructions.
//!
//! Every processed instruction carries exactly one annotation describing
//! its inferred stack effect; branch, call and v-call instructions extend
//! it with their control-flow payload. The [`StackEffect`] trait gives
//! uniform access to the shared header across the variants.

use enum_dispatch::enum_dispatch;

use devirt_interface::{ECallCode, MetadataToken, MethodSignature};

/// Uniform access to the inferred stack effect of an annotation.
#[enum_dispatch]
pub trait StackEffect {
    /// Number of values the instruction pops.
    fn inferred_pop(&self) -> u32;
    /// Number of values the instruction pushes.
    fn inferred_push(&self) -> u32;
}

/// The annotation attached to a processed instruction.
#[enum_dispatch(StackEffect)]
#[derive(Debug, Clone, PartialEq)]
pub enum Annotation {
    /// No control-flow payload.
    Plain(PlainAnnotation),
    /// Branch with inferred targets.
    Jump(JumpAnnotation),
    /// Call to another export.
    Call(CallAnnotation),
    /// Specialized v-call.
    VCall(VCallAnnotation),
}

/// Stack effect of a straight-line instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlainAnnotation {
    /// Values popped.
    pub inferred_pop: u32,
    /// Values pushed.
    pub inferred_push: u32,
}

impl StackEffect for PlainAnnotation {
    fn inferred_pop(&self) -> u32 {
        self.inferred_pop
    }

    fn inferred_push(&self) -> u32 {
        self.inferred_push
    }
}

/// Inferred branch targets of a jump instruction. The target list is empty
/// only when inference failed on the address operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpAnnotation {
    /// Values popped.
    pub inferred_pop: u32,
    /// Values pushed.
    pub inferred_push: u32,
    /// Concrete branch targets, one per resolvable data source.
    pub inferred_targets: Vec<u64>,
}

impl StackEffect for JumpAnnotation {
    fn inferred_pop(&self) -> u32 {
        self.inferred_pop
    }

    fn inferred_push(&self) -> u32 {
        self.inferred_push
    }
}

/// A resolved `CALL` site.
#[derive(Debug, Clone, PartialEq)]
pub struct CallAnnotation {
    /// Values popped (target plus arguments).
    pub inferred_pop: u32,
    /// Values pushed; calls return through `R0`, so this is always 0.
    pub inferred_push: u32,
    /// Inferred entry offset of the callee.
    pub address: u64,
    /// Export id of the callee.
    pub callee: u32,
    /// The callee's signature.
    pub signature: MethodSignature,
    /// Whether the callee leaves a value in `R0`.
    pub returns_value: bool,
}

impl StackEffect for CallAnnotation {
    fn inferred_pop(&self) -> u32 {
        self.inferred_pop
    }

    fn inferred_push(&self) -> u32 {
        self.inferred_push
    }
}

/// A specialized `VCALL` site.
#[derive(Debug, Clone, PartialEq)]
pub struct VCallAnnotation {
    /// Values popped (selector plus sub-opcode operands).
    pub inferred_pop: u32,
    /// Values pushed.
    pub inferred_push: u32,
    /// The resolved sub-opcode payload.
    pub call: VCallKind,
}

impl StackEffect for VCallAnnotation {
    fn inferred_pop(&self) -> u32 {
        self.inferred_pop
    }

    fn inferred_push(&self) -> u32 {
        self.inferred_push
    }
}

/// Payload of a resolved v-call.
#[derive(Debug, Clone, PartialEq)]
pub enum VCallKind {
    /// Managed call into the host runtime.
    Ecall {
        /// Token of the invoked method.
        method: MetadataToken,
        /// Call kind.
        opcode: ECallCode,
        /// Whether a value is pushed back.
        returns_value: bool,
    },
    /// Box a value into an object.
    Box {
        /// Token of the boxed type.
        ty: MetadataToken,
    },
    /// Unbox an object into a value.
    Unbox {
        /// Token of the target type.
        ty: MetadataToken,
    },
    /// Checked cast.
    Cast {
        /// Token of the target type.
        ty: MetadataToken,
    },
    /// Construct an object.
    NewObj {
        /// Token of the constructor.
        ctor: MetadataToken,
    },
    /// Load a field.
    LdFld {
        /// Token of the field.
        field: MetadataToken,
    },
    /// Store a field.
    StFld {
        /// Token of the field.
        field: MetadataToken,
    },
    /// Load a runtime handle for a token.
    LdToken {
        /// The referenced token.
        token: MetadataToken,
    },
    /// Throw the popped exception object.
    Throw,
    /// Size of a type, in bytes.
    SizeOf {
        /// Token of the measured type.
        ty: MetadataToken,
    },
    /// Zero-initialize the pointee of the popped address.
    InitObj {
        /// Token of the initialized type.
        ty: MetadataToken,
    },
    /// Trap on non-finite floats.
    CkFinite,
    /// Allocate interpreter-local memory.
    LocAlloc,
    /// Debugger break.
    Break,
}
