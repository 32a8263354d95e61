use crate::{
    address_range::{is_rom_segment, rom_ranges, segment_contents, AddressRange, AddressRangeType},
    Rom,
};
use assert_into::AssertInto;
use elf::{
    abi::{SHF_ALLOC, SHT_PROGBITS},
    endian::AnyEndian,
    segment::ProgramHeader,
    ElfStream, ParseError,
};
use log::{debug, warn};
use std::{
    cmp::min,
    io::{Read, Seek},
    ops::Range,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ElfRomError {
    #[error("Failed to parse elf file")]
    Parse(#[from] ParseError),
    #[error("No ROM program memory found")]
    NoRom,
    #[error("Address {0:#x} is lower than ROM")]
    StartBelowRom(u64),
    #[error("ROM memory not contiguous between {start:#x}..{end:#x}, missing data after {covered:#x}")]
    NotContiguous { start: u64, end: u64, covered: u64 },
    #[error("Attempted to read {addr:#x}..{end:#x}, completely out of ROM bounds")]
    OutOfBounds { addr: u64, end: u64 },
    #[error("Segment at {paddr:#x} of {size} bytes overflows the address space")]
    SegmentOverflow { paddr: u64, size: u64 },
}

/// A section that ends up in flash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RomSection {
    pub name: String,
    pub addr: u64,
    pub size: u64,
}

/// An ELF file viewed as the read only memory it programs.
///
/// Only `PT_LOAD` segments with file contents below `flash_end` are considered ROM.
pub struct FirmwareElf<S: Read + Seek> {
    elf: ElfStream<AnyEndian, S>,
    rom_segments: Vec<ProgramHeader>,
    ranges: Vec<AddressRange>,
    flash_end: u64,
}

impl<S: Read + Seek> FirmwareElf<S> {
    pub fn open(input: S, flash_end: u64) -> Result<Self, ElfRomError> {
        let elf = ElfStream::<AnyEndian, _>::open_stream(input)?;
        let rom_segments: Vec<ProgramHeader> = elf
            .segments()
            .iter()
            .filter(|seg| is_rom_segment(seg, flash_end))
            .cloned()
            .collect();
        let ranges = rom_ranges(&rom_segments)?;
        debug!(
            "{} of {} segments are ROM",
            rom_segments.len(),
            elf.segments().len()
        );

        Ok(Self {
            elf,
            rom_segments,
            ranges,
            flash_end,
        })
    }

    pub fn entry(&self) -> u64 {
        self.elf.ehdr.e_entry
    }

    pub fn rom_segments(&self) -> &[ProgramHeader] {
        &self.rom_segments
    }

    /// Allocated `PROGBITS` sections below flash end, in file order.
    pub fn rom_sections(&mut self) -> Result<Vec<RomSection>, ElfRomError> {
        let flash_end = self.flash_end;
        let (shdrs, strtab) = self.elf.section_headers_with_strtab()?;

        let mut sections = Vec::new();
        for shdr in shdrs.iter() {
            if shdr.sh_type != SHT_PROGBITS
                || (shdr.sh_flags & SHF_ALLOC as u64) == 0
                || shdr.sh_addr >= flash_end
            {
                continue;
            }
            let name = match &strtab {
                Some(strtab) => strtab.get(shdr.sh_name as usize)?.to_string(),
                None => String::new(),
            };
            sections.push(RomSection {
                name,
                addr: shdr.sh_addr,
                size: shdr.sh_size,
            });
        }

        Ok(sections)
    }

    /// Lowest to highest physical address covered by ROM segments.
    pub fn rom_range(&self) -> Result<Range<u64>, ElfRomError> {
        let start = self.ranges.iter().map(|r| r.from).min();
        let end = self.ranges.iter().map(|r| r.to).max();

        match (start, end) {
            (Some(start), Some(end)) if start < end => Ok(start..end),
            _ => Err(ElfRomError::NoRom),
        }
    }

    /// Checks the ROM segments cover `range` without holes.
    pub fn ensure_rom_contiguous(&self, range: Range<u64>) -> Result<(), ElfRomError> {
        let mut covered = range.start;

        // Segments may be listed out of address order.
        for _ in 0..self.ranges.len() {
            for r in self.ranges.iter() {
                if !r.contains(covered) {
                    continue;
                }
                covered = r.to;
                if covered >= range.end {
                    return Ok(());
                }
            }
        }

        if covered == range.start {
            return Err(ElfRomError::StartBelowRom(range.start));
        }
        Err(ElfRomError::NotContiguous {
            start: range.start,
            end: range.end,
            covered,
        })
    }

    /// Fills `buf` with ROM contents starting at physical address `addr`.
    ///
    /// Bytes not backed by file contents read as zero. Returns the index one past the last
    /// byte written from the file. A read that overlaps no file contents at all fails.
    pub fn read_rom_at(&mut self, buf: &mut [u8], addr: u64) -> Result<usize, ElfRomError> {
        let end = addr
            .checked_add(buf.len() as u64)
            .ok_or(ElfRomError::OutOfBounds {
                addr,
                end: u64::MAX,
            })?;
        let has_contents = self
            .ranges
            .iter()
            .any(|r| r.typ == AddressRangeType::Contents && r.overlaps(addr, end));
        if !has_contents {
            return Err(ElfRomError::OutOfBounds { addr, end });
        }

        buf.fill(0);
        let mut max_read = 0;
        for seg in &self.rom_segments {
            let contents = segment_contents(seg)?;
            if !contents.overlaps(addr, end) {
                continue;
            }

            let data = self.elf.segment_data(seg)?;
            let seg_offset: usize = addr.saturating_sub(seg.p_paddr).assert_into();
            let buf_offset: usize = seg.p_paddr.saturating_sub(addr).assert_into();
            let data = data.get(seg_offset..).unwrap_or(&[]);
            let len = min(data.len(), buf.len() - buf_offset);

            buf[buf_offset..buf_offset + len].copy_from_slice(&data[..len]);
            max_read = max_read.max(buf_offset + len);
        }

        Ok(max_read)
    }

    /// Reads the ROM image, at most `read_limit` bytes of it.
    pub fn read_rom(&mut self, read_limit: u64) -> Result<Rom, ElfRomError> {
        let range = self.rom_range()?;
        let mut size = range.end - range.start;
        if size > read_limit {
            warn!("ROM {} too large, limiting to {}", size, read_limit);
            size = read_limit;
        }

        let mut data = vec![0; size.assert_into()];
        let read = self.read_rom_at(&mut data, range.start)?;
        data.truncate(read);

        Ok(Rom {
            base: range.start,
            data,
        })
    }
}
