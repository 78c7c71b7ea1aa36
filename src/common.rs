//! Common definitions that are shared between different parts of the
//! decompiler.

pub mod cancel;
pub mod disjoint;

// Use sorted sets and maps for consistent output
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Identifiers.
pub type Id = internment::Intern<String>;

/// Makes an [Id] from anything string-like.
pub fn id(name: impl Into<String>) -> Id {
    Id::new(name.into())
}

/// A virtual address inside the loaded executable image.
pub type ByteAddr = u64;

/// A width or size measured in bits.
pub type BitSize = u32;

/// A bit offset inside an address space.  Offsets may be negative: stack
/// slots below the entry value of the stack pointer live at negative
/// offsets of the stack address space.
pub type BitAddr = i64;

/// Renders an address the way all diagnostics do, so messages about the
/// same instruction are greppable across analyses.
pub fn format_addr(addr: Option<ByteAddr>) -> String {
    match addr {
        Some(addr) => format!("0x{addr:x}"),
        None => "<synthesized>".to_owned(),
    }
}
