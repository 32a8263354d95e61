use elf::{abi::PT_LOAD, segment::ProgramHeader};

use crate::elf::ElfRomError;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddressRangeType {
    /// Backed by file contents
    Contents,
    /// Zero initialized, no file contents (BSS tail of a segment)
    NoContents,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressRange {
    pub typ: AddressRangeType,
    pub to: u64,
    pub from: u64,
}

impl AddressRange {
    pub const fn new(from: u64, to: u64, typ: AddressRangeType) -> Self {
        Self { typ, to, from }
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.from <= addr && addr < self.to
    }

    /// Whether `[from, to)` shares at least one address with this range.
    pub fn overlaps(&self, from: u64, to: u64) -> bool {
        from < self.to && to > self.from
    }
}

/// A program header describes read only memory when it loads file contents into memory.
pub fn is_rom_segment(seg: &ProgramHeader, flash_end: u64) -> bool {
    seg.p_type == PT_LOAD && seg.p_filesz > 0 && seg.p_offset > 0 && seg.p_paddr < flash_end
}

/// Physical addresses of the file backed part of a segment.
pub fn segment_contents(seg: &ProgramHeader) -> Result<AddressRange, ElfRomError> {
    let end = seg
        .p_paddr
        .checked_add(seg.p_filesz)
        .ok_or(ElfRomError::SegmentOverflow {
            paddr: seg.p_paddr,
            size: seg.p_filesz,
        })?;
    Ok(AddressRange::new(
        seg.p_paddr,
        end,
        AddressRangeType::Contents,
    ))
}

/// Physical address ranges of the ROM segments, split into initialized and BSS parts.
pub fn rom_ranges<'a>(
    segments: impl IntoIterator<Item = &'a ProgramHeader>,
) -> Result<Vec<AddressRange>, ElfRomError> {
    let mut ranges = Vec::new();

    for seg in segments {
        // initialized contents
        let contents = segment_contents(seg)?;
        ranges.push(contents);

        if seg.p_memsz > seg.p_filesz {
            let end = seg
                .p_paddr
                .checked_add(seg.p_memsz)
                .ok_or(ElfRomError::SegmentOverflow {
                    paddr: seg.p_paddr,
                    size: seg.p_memsz,
                })?;
            // uninitialized (BSS)
            ranges.push(AddressRange::new(
                contents.to,
                end,
                AddressRangeType::NoContents,
            ));
        }
    }

    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(
        p_type: u32,
        p_offset: u64,
        p_paddr: u64,
        p_filesz: u64,
        p_memsz: u64,
    ) -> ProgramHeader {
        ProgramHeader {
            p_type,
            p_offset,
            p_vaddr: p_paddr,
            p_paddr,
            p_filesz,
            p_memsz,
            p_flags: 0,
            p_align: 4,
        }
    }

    #[test]
    fn rom_segment_filter() {
        let flash_end = 0x2000_0000;
        assert!(is_rom_segment(&segment(PT_LOAD, 0x100, 0x1000_0000, 0x10, 0x10), flash_end));
        // Starts past flash end
        assert!(!is_rom_segment(&segment(PT_LOAD, 0x100, 0x2000_0000, 0x10, 0x10), flash_end));
        // BSS only
        assert!(!is_rom_segment(&segment(PT_LOAD, 0x100, 0x1000_0000, 0, 0x10), flash_end));
        // Not loaded
        assert!(!is_rom_segment(&segment(0, 0x100, 0x1000_0000, 0x10, 0x10), flash_end));
        // Covers the ELF header
        assert!(!is_rom_segment(&segment(PT_LOAD, 0, 0x1000_0000, 0x10, 0x10), flash_end));
    }

    #[test]
    fn ranges_split_bss() {
        let segments = [segment(PT_LOAD, 0x100, 0x1000_0000, 0x10, 0x18)];
        assert_eq!(
            rom_ranges(&segments).unwrap(),
            [
                AddressRange::new(0x1000_0000, 0x1000_0010, AddressRangeType::Contents),
                AddressRange::new(0x1000_0010, 0x1000_0018, AddressRangeType::NoContents),
            ]
        );
    }

    #[test]
    fn segment_end_overflow() {
        let segments = [segment(PT_LOAD, 0x100, u64::MAX - 4, 8, 8)];
        assert!(matches!(
            rom_ranges(&segments),
            Err(ElfRomError::SegmentOverflow { size: 8, .. })
        ));

        // Contents fit, the BSS tail does not.
        let segments = [segment(PT_LOAD, 0x100, u64::MAX - 8, 4, 16)];
        assert!(matches!(
            rom_ranges(&segments),
            Err(ElfRomError::SegmentOverflow { size: 16, .. })
        ));
        assert_eq!(
            segment_contents(&segments[0]).unwrap().to,
            u64::MAX - 4
        );
    }

    #[test]
    fn overlap_and_contains() {
        let range = AddressRange::new(0x10, 0x20, AddressRangeType::Contents);
        assert!(range.contains(0x10));
        assert!(!range.contains(0x20));
        assert!(range.overlaps(0x1f, 0x30));
        assert!(!range.overlaps(0x20, 0x30));
        assert!(!range.overlaps(0x0, 0x10));
    }
}
