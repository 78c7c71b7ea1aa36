//! Decoded machine instructions and the decoder interface.
//!
//! Decoding itself is somebody else's job: the crate drives an external
//! decoder through the [InstructionDecoder] trait and only keeps what it
//! needs for diagnostics and dumps.

use crate::common::*;

/// One decoded machine instruction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Instruction {
    addr: ByteAddr,
    bytes: Vec<u8>,
    mnemonic: Id,
    operands: String,
}

impl Instruction {
    pub fn new(addr: ByteAddr, bytes: Vec<u8>, mnemonic: Id, operands: String) -> Self {
        Self {
            addr,
            bytes,
            mnemonic,
            operands,
        }
    }

    pub fn addr(&self) -> ByteAddr {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mnemonic(&self) -> Id {
        self.mnemonic
    }

    pub fn operands(&self) -> &str {
        &self.operands
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.operands.is_empty() {
            write!(f, "0x{:x}: {}", self.addr, self.mnemonic)
        } else {
            write!(f, "0x{:x}: {} {}", self.addr, self.mnemonic, self.operands)
        }
    }
}

/// The external instruction decoder.  Given a program counter and a
/// window of bytes, it either decodes one instruction or gives up.
pub trait InstructionDecoder {
    fn decode(&self, addr: ByteAddr, bytes: &[u8]) -> Option<Instruction>;
}

/// The decoder used when none was plugged in; it decodes nothing.
pub struct NullDecoder;

impl InstructionDecoder for NullDecoder {
    fn decode(&self, _addr: ByteAddr, _bytes: &[u8]) -> Option<Instruction> {
        None
    }
}

/// All decoded instructions of an image, indexed by address.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Instructions {
    by_addr: Map<ByteAddr, Instruction>,
}

impl Instructions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, instruction: Instruction) {
        self.by_addr.insert(instruction.addr(), instruction);
    }

    pub fn get(&self, addr: ByteAddr) -> Option<&Instruction> {
        self.by_addr.get(&addr)
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Instructions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.by_addr.values()
    }
}
