//! The metadata-image contract.
//!
//! The obfuscator keeps managed metadata (types, methods, fields) in the
//! host binary and refers to it from the instruction stream through small
//! reference ids. The surrounding toolchain owns the actual metadata
//! reader; the core resolves ids and tokens exclusively through the
//! [`MetadataImage`] trait.

use std::fmt;

use thiserror::Error;

use crate::{constants::VmConstants, il::VmType};

/// A coded metadata token: table id in the top byte, row id below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetadataToken(pub u32);

impl MetadataToken {
    /// The table the token points into, when the table byte is known.
    pub fn kind(self) -> Option<TokenKind> {
        match self.0 >> 24 {
            0x01 => Some(TokenKind::TypeRef),
            0x02 => Some(TokenKind::TypeDef),
            0x04 => Some(TokenKind::Field),
            0x06 => Some(TokenKind::MethodDef),
            0x0A => Some(TokenKind::MemberRef),
            0x11 => Some(TokenKind::StandAloneSig),
            0x1B => Some(TokenKind::TypeSpec),
            0x2B => Some(TokenKind::MethodSpec),
            _ => None,
        }
    }

    /// Row id within the table.
    pub fn rid(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }
}

impl fmt::Display for MetadataToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Metadata tables a VM-level reference may legally resolve into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum TokenKind {
    TypeDef,
    TypeRef,
    TypeSpec,
    MethodDef,
    MemberRef,
    MethodSpec,
    Field,
    StandAloneSig,
}

/// Method signature as recorded in the export directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    /// Raw signature flags; tested against `VmConstants::flag_instance`.
    pub flags: u8,
    /// Parameter type tokens, leftmost first, excluding `this`.
    pub param_tokens: Vec<MetadataToken>,
    /// Return type token.
    pub return_token: MetadataToken,
}

impl MethodSignature {
    /// Whether the method takes a `this` argument.
    pub fn is_instance(&self, constants: &VmConstants) -> bool {
        self.flags & constants.flag_instance != 0
    }

    /// Number of declared parameters, excluding `this`.
    pub fn param_count(&self) -> usize {
        self.param_tokens.len()
    }
}

/// A resolved metadata member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberRef {
    /// A type.
    Type(TypeDesc),
    /// A method.
    Method(MethodDesc),
    /// A field.
    Field(FieldDesc),
}

/// Resolved type description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDesc {
    /// Token of the type.
    pub token: MetadataToken,
    /// VM-level type of values of this type.
    pub vm_type: VmType,
    /// Whether this is the void pseudo-type.
    pub is_void: bool,
}

/// Resolved method description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDesc {
    /// Token of the method.
    pub token: MetadataToken,
    /// The method's signature.
    pub signature: MethodSignature,
}

/// Resolved field description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDesc {
    /// Token of the field.
    pub token: MetadataToken,
    /// VM-level type of the field's values.
    pub vm_type: VmType,
}

/// Read-only view of the host binary's managed metadata.
///
/// Implementations are shared by reference across concurrently running
/// drivers, so every method takes `&self`.
pub trait MetadataImage {
    /// Returns the member a token refers to, if the token is valid.
    fn resolve_member(&self, token: MetadataToken) -> Option<MemberRef>;

    /// Maps a VM-level reference id (as found in the instruction stream at
    /// `offset`) to a metadata token within one of the `allowed` tables.
    fn resolve_reference(
        &self,
        offset: u64,
        id: u32,
        allowed: &[TokenKind],
    ) -> Result<MetadataToken, ImageError>;
}

/// Errors produced by a [`MetadataImage`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImageError {
    /// The reference id is not present in the reference directory.
    #[error("reference id {id:#x} at {offset:#x} is unknown")]
    UnknownReference {
        /// Offset of the referencing instruction.
        offset: u64,
        /// The unresolved id.
        id: u32,
    },
    /// The id resolved to a token outside the allowed tables.
    #[error("reference id {id:#x} at {offset:#x} resolves to {token} which is outside the allowed tables")]
    DisallowedKind {
        /// Offset of the referencing instruction.
        offset: u64,
        /// The resolved id.
        id: u32,
        /// The token it resolved to.
        token: MetadataToken,
    },
}
