//! Architecture descriptions.
//!
//! Everything the analyses need to know about a CPU: how its registers
//! map onto address spaces, which register is the stack pointer, what the
//! default calling convention looks like, and how to decode its
//! instructions.  The analyses reach the architecture only through this
//! type, so adding a CPU means adding a constructor here (or building an
//! [Architecture] value elsewhere), never touching the middle-end.
//!
//! # Register model
//!
//! Each physical register gets an address space of its own; aliasing
//! register names are bit slices of that space.  On x86, `eax` is
//! `[0..32)` of the `eax` space while `al` and `ah` are `[0..8)` and
//! `[8..16)` of the same space, so a write to `al` partially kills a
//! pending definition of `eax` with no special cases anywhere.  The
//! flags register is one space with the individual flags at their
//! architectural bit positions.

use crate::common::*;
use crate::front::image::ByteOrder;
use crate::front::insn::{InstructionDecoder, NullDecoder};
use crate::front::lower::InstructionLowering;
use crate::middle::ir::{Domain, MemoryLocation};

/// A named register, described as the slice of register space it
/// occupies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RegisterDesc {
    pub name: Id,
    pub location: MemoryLocation,
}

/// A calling convention: where arguments arrive, where the return value
/// is left, and where the return address lives at function entry.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Convention {
    /// Candidate argument locations, in passing order.
    pub arguments: Vec<MemoryLocation>,
    pub return_value: Option<MemoryLocation>,
    pub return_address: MemoryLocation,
}

pub struct Architecture {
    name: Id,
    bitness: BitSize,
    byte_order: ByteOrder,
    max_instruction_size: usize,
    registers: Vec<RegisterDesc>,
    stack_pointer: MemoryLocation,
    convention: Convention,
    decoder: Box<dyn InstructionDecoder>,
    lowering: Option<Box<dyn InstructionLowering>>,
}

impl Architecture {
    pub fn new(
        name: Id,
        bitness: BitSize,
        byte_order: ByteOrder,
        max_instruction_size: usize,
        registers: Vec<RegisterDesc>,
        stack_pointer: MemoryLocation,
        convention: Convention,
    ) -> Self {
        Self {
            name,
            bitness,
            byte_order,
            max_instruction_size,
            registers,
            stack_pointer,
            convention,
            decoder: Box::new(NullDecoder),
            lowering: None,
        }
    }

    /// Plugs in the external instruction decoder.
    pub fn with_decoder(mut self, decoder: Box<dyn InstructionDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Plugs in the lowering that turns this architecture's instructions
    /// into IR.
    pub fn with_lowering(mut self, lowering: Box<dyn InstructionLowering>) -> Self {
        self.lowering = Some(lowering);
        self
    }

    pub fn name(&self) -> Id {
        self.name
    }

    /// Pointer width in bits.
    pub fn bitness(&self) -> BitSize {
        self.bitness
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn max_instruction_size(&self) -> usize {
        self.max_instruction_size
    }

    pub fn registers(&self) -> &[RegisterDesc] {
        &self.registers
    }

    pub fn stack_pointer(&self) -> MemoryLocation {
        self.stack_pointer
    }

    pub fn convention(&self) -> &Convention {
        &self.convention
    }

    pub fn decoder(&self) -> &dyn InstructionDecoder {
        &*self.decoder
    }

    pub fn lowering(&self) -> Option<&dyn InstructionLowering> {
        self.lowering.as_deref()
    }

    /// True iff the location belongs to the shared machine-memory space,
    /// as opposed to a register, the stack, or a temporary.
    pub fn is_global_memory(&self, location: &MemoryLocation) -> bool {
        location.domain() == Domain::MEMORY
    }

    pub fn register_by_name(&self, name: &str) -> Option<&RegisterDesc> {
        self.registers
            .iter()
            .find(|register| register.name.as_str() == name)
    }

    /// The smallest named register whose slice covers `location`.  Used
    /// to render register operands in dumps and emitted code.
    pub fn register_covering(&self, location: &MemoryLocation) -> Option<&RegisterDesc> {
        self.registers
            .iter()
            .filter(|register| register.location.covers(location))
            .min_by_key(|register| register.location.size())
    }

    /// 32-bit x86, the one table bundled with the crate.
    pub fn i386() -> Architecture {
        let mut registers = Vec::new();
        let gpr = |index: u32| Domain(Domain::FIRST_REGISTER.0 + index);
        let names32 = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
        let names16 = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
        for (index, (&name32, &name16)) in names32.iter().zip(&names16).enumerate() {
            let domain = gpr(index as u32);
            registers.push(RegisterDesc {
                name: id(name32),
                location: MemoryLocation::new(domain, 0, 32),
            });
            registers.push(RegisterDesc {
                name: id(name16),
                location: MemoryLocation::new(domain, 0, 16),
            });
        }
        for (index, &name) in ["al", "cl", "dl", "bl"].iter().enumerate() {
            registers.push(RegisterDesc {
                name: id(name),
                location: MemoryLocation::new(gpr(index as u32), 0, 8),
            });
        }
        for (index, &name) in ["ah", "ch", "dh", "bh"].iter().enumerate() {
            registers.push(RegisterDesc {
                name: id(name),
                location: MemoryLocation::new(gpr(index as u32), 8, 8),
            });
        }
        // Flags share one space at their positions in EFLAGS.
        let flags = Domain(Domain::FIRST_REGISTER.0 + 8);
        for (name, bit) in [("cf", 0), ("zf", 6), ("sf", 7), ("of", 11)] {
            registers.push(RegisterDesc {
                name: id(name),
                location: MemoryLocation::new(flags, bit, 1),
            });
        }

        let esp = MemoryLocation::new(gpr(4), 0, 32);
        let eax = MemoryLocation::new(gpr(0), 0, 32);
        // cdecl: arguments on the stack above the return address slot.
        let convention = Convention {
            arguments: (0..8)
                .map(|index| MemoryLocation::new(Domain::STACK, 32 + index * 32, 32))
                .collect(),
            return_value: Some(eax),
            return_address: MemoryLocation::new(Domain::STACK, 0, 32),
        };

        Architecture::new(
            id("i386"),
            32,
            ByteOrder::Little,
            15,
            registers,
            esp,
            convention,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_registers_share_their_parents_space() {
        let arch = Architecture::i386();
        let eax = arch.register_by_name("eax").unwrap().location;
        let al = arch.register_by_name("al").unwrap().location;
        let ah = arch.register_by_name("ah").unwrap().location;
        assert!(eax.covers(&al));
        assert!(eax.covers(&ah));
        assert!(!al.overlaps(&ah));
        let covering = arch.register_covering(&al).unwrap();
        assert_eq!(covering.name.as_str(), "al");
    }

    #[test]
    fn the_stack_pointer_is_a_register_slice() {
        let arch = Architecture::i386();
        assert_eq!(
            arch.stack_pointer(),
            arch.register_by_name("esp").unwrap().location
        );
        assert!(!arch.is_global_memory(&arch.stack_pointer()));
        assert!(arch.is_global_memory(&MemoryLocation::new(Domain::MEMORY, 0x1000 * 8, 32)));
    }

    #[test]
    fn cdecl_arguments_sit_above_the_return_address() {
        let arch = Architecture::i386();
        let convention = arch.convention();
        assert_eq!(convention.return_address.addr(), 0);
        assert_eq!(convention.arguments[0].addr(), 32);
        assert_eq!(convention.arguments[1].addr(), 64);
    }
}
