//! # Devirtualizer Collaborator Contracts
//!
//! This crate defines everything the inference core shares with its external
//! collaborators: the logical instruction set and its static metadata, the
//! resolved constants table produced by the constants-resolution pass, the
//! instruction-decoder contract over the host binary's encrypted stream, the
//! metadata-image contract, and the export directory.
//!
//! The core never parses the host binary itself. It consumes a populated
//! [`VmConstants`], an [`InstructionDecoder`], a [`MetadataImage`] and an
//! [`ExportDirectory`], and produces annotated disassembly records; keeping
//! these contracts in their own crate lets the surrounding toolchain evolve
//! its binary parsers without touching the engine.

pub use self::{constants::*, decoder::*, exports::*, il::*, image::*};

mod constants;
mod decoder;
mod exports;
mod il;
mod image;
