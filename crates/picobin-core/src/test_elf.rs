//! Minimal little-endian ELF32 images for tests.

use elf::abi::{PT_LOAD, SHF_ALLOC, SHT_PROGBITS, SHT_STRTAB};

pub const FLASH_START: u64 = 0x1000_0000;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const SHDR_SIZE: usize = 40;

struct Segment {
    paddr: u64,
    data: Vec<u8>,
    memsz: u64,
}

struct Section {
    name: String,
    addr: u64,
    size: u64,
}

#[derive(Default)]
pub struct ElfBuilder {
    entry: u32,
    segments: Vec<Segment>,
    sections: Vec<Section>,
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, entry: u32) -> Self {
        self.entry = entry;
        self
    }

    /// A `PT_LOAD` segment at `paddr` with `data` as file contents.
    pub fn segment(mut self, paddr: u64, data: Vec<u8>, memsz: u64) -> Self {
        self.segments.push(Segment { paddr, data, memsz });
        self
    }

    /// An allocated `PROGBITS` section header. Its contents are not written.
    pub fn section(mut self, name: &str, addr: u64, size: u64) -> Self {
        self.sections.push(Section {
            name: name.to_string(),
            addr,
            size,
        });
        self
    }

    pub fn build(self) -> Vec<u8> {
        let phoff = EHDR_SIZE;
        let mut offset = phoff + self.segments.len() * PHDR_SIZE;

        let mut contents = Vec::new();
        let mut phdrs = Vec::new();
        for seg in &self.segments {
            put_u32(&mut phdrs, PT_LOAD);
            put_u32(&mut phdrs, offset as u32);
            put_u32(&mut phdrs, seg.paddr as u32);
            put_u32(&mut phdrs, seg.paddr as u32);
            put_u32(&mut phdrs, seg.data.len() as u32);
            put_u32(&mut phdrs, seg.memsz as u32);
            put_u32(&mut phdrs, 0b101);
            put_u32(&mut phdrs, 4);

            contents.extend_from_slice(&seg.data);
            offset += seg.data.len();
            while offset % 4 != 0 {
                contents.push(0);
                offset += 1;
            }
        }

        let (shoff, shnum, shstrndx) = if self.sections.is_empty() {
            (0, 0, 0)
        } else {
            let strtab_offset = offset;
            let mut strtab = vec![0];
            let mut shdrs = vec![0; SHDR_SIZE];
            for section in &self.sections {
                let name = strtab.len() as u32;
                strtab.extend_from_slice(section.name.as_bytes());
                strtab.push(0);
                put_shdr(
                    &mut shdrs,
                    [
                        name,
                        SHT_PROGBITS,
                        SHF_ALLOC as u32,
                        section.addr as u32,
                        0,
                        section.size as u32,
                    ],
                );
            }
            let name = strtab.len() as u32;
            strtab.extend_from_slice(b".shstrtab\0");
            while strtab.len() % 4 != 0 {
                strtab.push(0);
            }
            put_shdr(
                &mut shdrs,
                [
                    name,
                    SHT_STRTAB,
                    0,
                    0,
                    strtab_offset as u32,
                    strtab.len() as u32,
                ],
            );

            let shoff = strtab_offset + strtab.len();
            contents.extend_from_slice(&strtab);
            contents.extend_from_slice(&shdrs);
            let shnum = self.sections.len() + 2;
            (shoff, shnum, shnum - 1)
        };

        let mut elf = Vec::new();
        elf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
        elf.extend_from_slice(&[0; 8]);
        put_u16(&mut elf, 2); // ET_EXEC
        put_u16(&mut elf, 40); // EM_ARM
        put_u32(&mut elf, 1);
        put_u32(&mut elf, self.entry);
        put_u32(&mut elf, if self.segments.is_empty() { 0 } else { phoff as u32 });
        put_u32(&mut elf, shoff as u32);
        put_u32(&mut elf, 0);
        put_u16(&mut elf, EHDR_SIZE as u16);
        put_u16(&mut elf, PHDR_SIZE as u16);
        put_u16(&mut elf, self.segments.len() as u16);
        put_u16(&mut elf, SHDR_SIZE as u16);
        put_u16(&mut elf, shnum as u16);
        put_u16(&mut elf, shstrndx as u16);
        assert_eq!(elf.len(), EHDR_SIZE);

        elf.extend_from_slice(&phdrs);
        elf.extend_from_slice(&contents);
        elf
    }
}

fn put_shdr(buf: &mut Vec<u8>, [name, typ, flags, addr, offset, size]: [u32; 6]) {
    for word in [name, typ, flags, addr, offset, size, 0, 0, 1, 0] {
        put_u32(buf, word);
    }
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}
