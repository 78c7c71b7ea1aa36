//! A minimal ELF loader: section headers, names, flags, and function
//! symbols.  Just enough of the format to feed the analyses; everything
//! fancier (relocations, dynamic linking) is out of scope.

use thiserror::Error;

use crate::common::*;
use crate::front::arch::Architecture;
use crate::front::image::{BufferByteSource, ByteOrder, Image, Section, SectionFlags, Symbol};

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const EM_386: u16 = 3;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_NOBITS: u32 = 8;
const SHF_WRITE: u64 = 1;
const SHF_ALLOC: u64 = 2;
const SHF_EXECINSTR: u64 = 4;
const STT_FUNC: u8 = 2;

#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum LoadError {
    #[error("the input is not in any supported format")]
    UnknownFormat,
    #[error("ELF signature doesn't match")]
    BadMagic,
    #[error("unknown ELF class: {0}")]
    UnknownClass(u8),
    #[error("unknown ELF data encoding: {0}")]
    UnknownEncoding(u8),
    #[error("unknown machine id: {0}")]
    UnknownMachine(u16),
    #[error("truncated input while reading {0}")]
    Truncated(&'static str),
}

/// What a loader produces: the image plus the architecture the input
/// declares.
pub struct LoadedImage {
    pub image: Image,
    pub arch: Architecture,
}

/// A file-format loader.  Loaders are probed in registry order.
pub trait Loader {
    fn name(&self) -> &'static str;
    fn can_parse(&self, data: &[u8]) -> bool;
    fn parse(&self, data: &[u8]) -> Result<LoadedImage, LoadError>;
}

/// All known loaders, in probing order.
pub fn loaders() -> Vec<Box<dyn Loader>> {
    vec![Box::new(ElfLoader)]
}

/// Probes every registered loader against the input.
pub fn load(data: &[u8]) -> Result<LoadedImage, LoadError> {
    for loader in loaders() {
        if loader.can_parse(data) {
            return loader.parse(data);
        }
    }
    Err(LoadError::UnknownFormat)
}

pub struct ElfLoader;

impl Loader for ElfLoader {
    fn name(&self) -> &'static str {
        "elf"
    }

    fn can_parse(&self, data: &[u8]) -> bool {
        data.starts_with(b"\x7fELF")
    }

    fn parse(&self, data: &[u8]) -> Result<LoadedImage, LoadError> {
        if !self.can_parse(data) {
            return Err(LoadError::BadMagic);
        }
        let class = *data.get(EI_CLASS).ok_or(LoadError::Truncated("ident"))?;
        let encoding = *data.get(EI_DATA).ok_or(LoadError::Truncated("ident"))?;
        let byte_order = match encoding {
            ELFDATA2LSB => ByteOrder::Little,
            ELFDATA2MSB => ByteOrder::Big,
            other => return Err(LoadError::UnknownEncoding(other)),
        };
        let reader = Reader {
            data,
            little: byte_order == ByteOrder::Little,
        };
        match class {
            ELFCLASS32 => parse_elf(&reader, byte_order, false),
            ELFCLASS64 => parse_elf(&reader, byte_order, true),
            other => Err(LoadError::UnknownClass(other)),
        }
    }
}

/// Byte-order aware reads from the raw input file.
struct Reader<'a> {
    data: &'a [u8],
    little: bool,
}

impl Reader<'_> {
    fn bytes(&self, offset: u64, len: usize, what: &'static str) -> Result<&[u8], LoadError> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(LoadError::Truncated(what))?;
        self.data.get(start..end).ok_or(LoadError::Truncated(what))
    }

    fn u8(&self, offset: u64, what: &'static str) -> Result<u8, LoadError> {
        Ok(self.bytes(offset, 1, what)?[0])
    }

    fn u16(&self, offset: u64, what: &'static str) -> Result<u16, LoadError> {
        let raw: [u8; 2] = self.bytes(offset, 2, what)?.try_into().expect("len checked");
        Ok(if self.little {
            u16::from_le_bytes(raw)
        } else {
            u16::from_be_bytes(raw)
        })
    }

    fn u32(&self, offset: u64, what: &'static str) -> Result<u32, LoadError> {
        let raw: [u8; 4] = self.bytes(offset, 4, what)?.try_into().expect("len checked");
        Ok(if self.little {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    fn u64(&self, offset: u64, what: &'static str) -> Result<u64, LoadError> {
        let raw: [u8; 8] = self.bytes(offset, 8, what)?.try_into().expect("len checked");
        Ok(if self.little {
            u64::from_le_bytes(raw)
        } else {
            u64::from_be_bytes(raw)
        })
    }

    /// A NUL-terminated string out of a string table.
    fn asciiz(&self, table: u64, index: u64) -> String {
        let start = (table + index) as usize;
        let mut end = start;
        while end < self.data.len() && self.data[end] != 0 {
            end += 1;
        }
        String::from_utf8_lossy(self.data.get(start..end).unwrap_or(&[])).into_owned()
    }
}

struct SectionHeader {
    name_index: u64,
    kind: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
}

fn parse_elf(reader: &Reader, byte_order: ByteOrder, wide: bool) -> Result<LoadedImage, LoadError> {
    let machine = reader.u16(18, "header")?;
    let arch = match machine {
        EM_386 => Architecture::i386(),
        other => return Err(LoadError::UnknownMachine(other)),
    };

    let (shoff, shentsize, shnum, shstrndx) = if wide {
        (
            reader.u64(40, "header")?,
            reader.u16(58, "header")? as u64,
            reader.u16(60, "header")? as u64,
            reader.u16(62, "header")? as u64,
        )
    } else {
        (
            reader.u32(32, "header")? as u64,
            reader.u16(46, "header")? as u64,
            reader.u16(48, "header")? as u64,
            reader.u16(50, "header")? as u64,
        )
    };

    let mut headers = Vec::new();
    for index in 0..shnum {
        let base = shoff + index * shentsize;
        let header = if wide {
            SectionHeader {
                name_index: reader.u32(base, "section header")? as u64,
                kind: reader.u32(base + 4, "section header")?,
                flags: reader.u64(base + 8, "section header")?,
                addr: reader.u64(base + 16, "section header")?,
                offset: reader.u64(base + 24, "section header")?,
                size: reader.u64(base + 32, "section header")?,
                link: reader.u32(base + 40, "section header")?,
            }
        } else {
            SectionHeader {
                name_index: reader.u32(base, "section header")? as u64,
                kind: reader.u32(base + 4, "section header")?,
                flags: reader.u32(base + 8, "section header")? as u64,
                addr: reader.u32(base + 12, "section header")? as u64,
                offset: reader.u32(base + 16, "section header")? as u64,
                size: reader.u32(base + 20, "section header")? as u64,
                link: reader.u32(base + 24, "section header")?,
            }
        };
        headers.push(header);
    }

    let shstrtab_offset = headers.get(shstrndx as usize).map(|header| header.offset);

    let mut image = Image::new();
    for header in &headers {
        let name = match shstrtab_offset {
            Some(table) => reader.asciiz(table, header.name_index),
            None => String::new(),
        };
        let mut section = Section::new(id(name), header.addr, header.size);
        section.set_byte_order(byte_order);

        let mut flags = SectionFlags::READABLE;
        flags.set(SectionFlags::ALLOCATED, header.flags & SHF_ALLOC != 0);
        flags.set(SectionFlags::WRITABLE, header.flags & SHF_WRITE != 0);
        flags.set(SectionFlags::EXECUTABLE, header.flags & SHF_EXECINSTR != 0);
        flags.set(
            SectionFlags::CODE,
            header.kind == SHT_PROGBITS && flags.contains(SectionFlags::EXECUTABLE),
        );
        flags.set(SectionFlags::BSS, header.kind == SHT_NOBITS);
        flags.set(
            SectionFlags::DATA,
            flags.contains(SectionFlags::ALLOCATED)
                && !flags.contains(SectionFlags::CODE)
                && !flags.contains(SectionFlags::BSS),
        );
        section.set_flags(flags);

        if header.kind != SHT_NOBITS {
            if let Ok(bytes) = reader.bytes(header.offset, header.size as usize, "section") {
                section.set_source(Box::new(BufferByteSource(bytes.to_vec())));
            }
        }
        image.add_section(section);
    }

    load_symbols(reader, &headers, &mut image, wide);

    Ok(LoadedImage { image, arch })
}

fn load_symbols(reader: &Reader, headers: &[SectionHeader], image: &mut Image, wide: bool) {
    let Some(symtab) = headers.iter().find(|header| header.kind == SHT_SYMTAB) else {
        return;
    };
    let Some(strtab) = headers.get(symtab.link as usize) else {
        return;
    };
    let entry_size: u64 = if wide { 24 } else { 16 };
    let count = symtab.size / entry_size;
    for index in 0..count {
        let base = symtab.offset + index * entry_size;
        let (name_index, value, info) = if wide {
            let Ok(name_index) = reader.u32(base, "symbol") else { break };
            let Ok(info) = reader.u8(base + 4, "symbol") else { break };
            let Ok(value) = reader.u64(base + 8, "symbol") else { break };
            (name_index as u64, value, info)
        } else {
            let Ok(name_index) = reader.u32(base, "symbol") else { break };
            let Ok(value) = reader.u32(base + 4, "symbol") else { break };
            let Ok(info) = reader.u8(base + 12, "symbol") else { break };
            (name_index as u64, value as u64, info)
        };
        if info & 0xf != STT_FUNC || value == 0 {
            continue;
        }
        let name = reader.asciiz(strtab.offset, name_index);
        if name.is_empty() {
            continue;
        }
        image.add_symbol(Symbol {
            name: id(name),
            addr: value,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Builds a tiny ELF32 with a null section, a .text, and the section
    // name string table.
    fn tiny_elf32() -> Vec<u8> {
        let mut data = vec![0u8; 52];
        data[..4].copy_from_slice(b"\x7fELF");
        data[EI_CLASS] = ELFCLASS32;
        data[EI_DATA] = ELFDATA2LSB;
        let put16 = |data: &mut Vec<u8>, offset: usize, value: u16| {
            data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        };
        let put32 = |data: &mut Vec<u8>, offset: usize, value: u32| {
            data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        };
        put16(&mut data, 18, EM_386);

        // Layout: strtab at 52, code bytes at 70, section headers at 74.
        let strtab = b"\0.text\0.shstrtab\0";
        assert_eq!(strtab.len(), 17);
        data.extend_from_slice(strtab); // 52..69
        data.push(0); // pad to 70
        data.extend_from_slice(&[0x90, 0xc3, 0, 0]); // 70..74
        let shoff = data.len();

        // Null section header.
        data.extend_from_slice(&[0u8; 40]);
        // .text: PROGBITS, alloc+exec, addr 0x8048000, offset 70, size 2.
        let mut text = [0u8; 40];
        text[0..4].copy_from_slice(&1u32.to_le_bytes()); // name index
        text[4..8].copy_from_slice(&SHT_PROGBITS.to_le_bytes());
        text[8..12].copy_from_slice(&((SHF_ALLOC | SHF_EXECINSTR) as u32).to_le_bytes());
        text[12..16].copy_from_slice(&0x8048000u32.to_le_bytes());
        text[16..20].copy_from_slice(&70u32.to_le_bytes());
        text[20..24].copy_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&text);
        // .shstrtab: STRTAB, offset 52, size 17.
        let mut names = [0u8; 40];
        names[0..4].copy_from_slice(&7u32.to_le_bytes());
        names[4..8].copy_from_slice(&3u32.to_le_bytes());
        names[16..20].copy_from_slice(&52u32.to_le_bytes());
        names[20..24].copy_from_slice(&17u32.to_le_bytes());
        data.extend_from_slice(&names);

        put32(&mut data, 32, shoff as u32);
        put16(&mut data, 46, 40);
        put16(&mut data, 48, 3);
        put16(&mut data, 50, 2);
        data
    }

    #[test]
    fn loads_sections_with_flags_and_names() {
        let data = tiny_elf32();
        let loaded = load(&data).unwrap();
        assert_eq!(loaded.arch.name().as_str(), "i386");
        let text = loaded.image.section_by_name(".text").unwrap();
        assert!(text.is_allocated() && text.is_executable() && text.is_code());
        assert!(!text.is_data() && !text.is_bss());
        assert_eq!(text.addr(), 0x8048000);
        assert_eq!(loaded.image.read_bytes(0x8048000, 2), vec![0x90, 0xc3]);
    }

    #[test]
    fn rejects_non_elf_input() {
        assert!(matches!(load(b"MZ\x90\x00"), Err(LoadError::UnknownFormat)));
    }

    #[test]
    fn rejects_unknown_machines() {
        let mut data = tiny_elf32();
        data[18] = 0xba;
        data[19] = 0xab;
        assert!(matches!(
            ElfLoader.parse(&data),
            Err(LoadError::UnknownMachine(_))
        ));
    }
}
