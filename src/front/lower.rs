//! The lowering interface: turning decoded instructions into IR.
//!
//! Lowering is where instruction semantics live, so it is supplied per
//! architecture, alongside the decoder.  The crate defines the contract
//! and drives whatever implementation the architecture carries.

use thiserror::Error;

use crate::common::*;
use crate::front::image::Image;
use crate::front::insn::Instructions;
use crate::middle::ir::Program;

#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum LowerError {
    #[error("no instruction at entry point 0x{0:x}")]
    MissingInstruction(ByteAddr),
    #[error("lowering failed at 0x{0:x}: {1}")]
    Failed(ByteAddr, String),
}

/// Lowers decoded instructions into a [Program].
///
/// `entries` are the function entry points to start from, typically the
/// image's function symbols, each with an optional name.
pub trait InstructionLowering {
    fn lower(
        &self,
        image: &Image,
        instructions: &Instructions,
        entries: &[(ByteAddr, Option<Id>)],
    ) -> Result<Program, LowerError>;
}
