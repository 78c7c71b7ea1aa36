//! The disassembly driver: walks executable code sections and feeds the
//! architecture's decoder.
//!
//! Linear sweep with single-byte resynchronization: when the decoder
//! rejects a window, the driver advances one byte and tries again, the
//! way interactive disassemblers recover from data embedded in code.

use log::debug;

use crate::common::cancel::{CancellationToken, Cancelled};
use crate::common::*;
use crate::front::arch::Architecture;
use crate::front::image::Image;
use crate::front::insn::Instructions;

/// Disassembles every code section of the image.
pub fn disassemble_image(
    image: &Image,
    arch: &Architecture,
    token: &CancellationToken,
) -> Result<Instructions, Cancelled> {
    let mut instructions = Instructions::new();
    for section in image.sections() {
        if !section.is_allocated() || !section.is_code() {
            continue;
        }
        debug!(
            "disassembling section '{}' at 0x{:x}",
            section.name(),
            section.addr()
        );
        disassemble_range(
            image,
            arch,
            section.addr(),
            section.addr() + section.size(),
            &mut instructions,
            token,
        )?;
    }
    Ok(instructions)
}

/// Disassembles the given address range.
pub fn disassemble_range(
    image: &Image,
    arch: &Architecture,
    begin: ByteAddr,
    end: ByteAddr,
    instructions: &mut Instructions,
    token: &CancellationToken,
) -> Result<(), Cancelled> {
    let mut addr = begin;
    while addr < end {
        token.check()?;
        let window = image.read_bytes(addr, arch.max_instruction_size());
        if window.is_empty() {
            break;
        }
        match arch.decoder().decode(addr, &window) {
            Some(instruction) if instruction.size() > 0 => {
                addr += instruction.size() as ByteAddr;
                instructions.add(instruction);
            }
            _ => {
                debug!("0x{addr:x}: undecodable byte, skipping");
                addr += 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::arch::Architecture;
    use crate::front::image::{BufferByteSource, Section, SectionFlags};
    use crate::front::insn::{Instruction, InstructionDecoder};

    // Decodes 0x90 as a one-byte `nop` and nothing else.
    struct NopDecoder;

    impl InstructionDecoder for NopDecoder {
        fn decode(&self, addr: ByteAddr, bytes: &[u8]) -> Option<Instruction> {
            match bytes.first() {
                Some(&0x90) => Some(Instruction::new(
                    addr,
                    vec![0x90],
                    id("nop"),
                    String::new(),
                )),
                _ => None,
            }
        }
    }

    fn code_image(addr: ByteAddr, bytes: &[u8]) -> Image {
        let mut image = Image::new();
        let mut section = Section::new(id(".text"), addr, bytes.len() as u64);
        section.set_flags(
            SectionFlags::ALLOCATED
                | SectionFlags::READABLE
                | SectionFlags::EXECUTABLE
                | SectionFlags::CODE,
        );
        section.set_source(Box::new(BufferByteSource(bytes.to_vec())));
        image.add_section(section);
        image
    }

    #[test]
    fn sweeps_code_and_resynchronizes_over_junk() {
        let image = code_image(0x1000, &[0x90, 0xff, 0x90]);
        let arch = Architecture::i386().with_decoder(Box::new(NopDecoder));
        let token = CancellationToken::new();
        let instructions = disassemble_image(&image, &arch, &token).unwrap();
        assert_eq!(instructions.len(), 2);
        assert!(instructions.get(0x1000).is_some());
        assert!(instructions.get(0x1001).is_none());
        assert!(instructions.get(0x1002).is_some());
    }

    #[test]
    fn cancellation_stops_the_sweep() {
        let image = code_image(0x1000, &[0x90; 16]);
        let arch = Architecture::i386().with_decoder(Box::new(NopDecoder));
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            disassemble_image(&image, &arch, &token),
            Err(Cancelled)
        );
    }
}
