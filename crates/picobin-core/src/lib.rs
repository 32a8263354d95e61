use crate::{
    chain::{find_next_block, walk_chain, ChainBlock, ChainError, ChainWalker},
    elf::{ElfRomError, FirmwareElf},
    uf2::{BlocksReader, Uf2Error, Uf2Formatter},
};
use std::{
    fmt,
    io::{Read, Seek, Write},
    str::FromStr,
};

use assert_into::AssertInto;
use log::*;
use thiserror::Error;

pub mod address_range;
pub mod block;
pub mod chain;
pub mod elf;
pub mod image_def;
pub mod item;
pub mod load_map;
pub mod uf2;

#[cfg(test)]
mod test_elf;

pub use block::{Block, BlockError};
pub use image_def::ImageDef;
pub use item::{Item, ItemError, ItemType};
pub use load_map::{LoadMap, LoadMapEntry};

/// Start of SRAM on RP2040 and RP2350, everything below is flash or boot ROM.
pub const DEFAULT_FLASH_END: u64 = 0x2000_0000;

/// Largest image searched for blocks unless told otherwise.
pub const DEFAULT_READ_LIMIT: u64 = 2 * 1024 * 1024;

// See https://github.com/microsoft/uf2/blob/master/utils/uf2families.json for list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum Family {
    /// Raspberry Pi RP2040
    RP2040 = 0xe48bff56,

    /// Raspberry Pi Microcontrollers: Absolute (unpartitioned) download
    RP2XXX_ABSOLUTE = 0xe48bff57,

    /// Raspberry Pi Microcontrollers: Data partition download
    RP2XXX_DATA = 0xe48bff58,

    /// Raspberry Pi RP2350, Secure Arm image
    RP2350_ARM_S = 0xe48bff59,

    /// Raspberry Pi RP2350, RISC-V image
    RP2350_RISCV = 0xe48bff5a,

    /// Raspberry Pi RP2350, Non-secure Arm image
    RP2350_ARM_NS = 0xe48bff5b,
}

impl Default for Family {
    fn default() -> Self {
        Self::RP2350_ARM_S
    }
}

impl Family {
    pub const ALL: [Family; 6] = [
        Self::RP2040,
        Self::RP2XXX_ABSOLUTE,
        Self::RP2XXX_DATA,
        Self::RP2350_ARM_S,
        Self::RP2350_RISCV,
        Self::RP2350_ARM_NS,
    ];

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::RP2040 => "rp2040",
            Self::RP2XXX_ABSOLUTE => "absolute",
            Self::RP2XXX_DATA => "data",
            Self::RP2350_ARM_S => "rp2350-arm-s",
            Self::RP2350_RISCV => "rp2350-riscv",
            Self::RP2350_ARM_NS => "rp2350-arm-ns",
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|family| family.id() == id)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown UF2 family '{0}'")]
pub struct UnknownFamily(pub String);

impl FromStr for Family {
    type Err = UnknownFamily;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|family| family.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownFamily(s.to_string()))
    }
}

/// Parses a family name or any numeric family id, decimal or `0x` prefixed hex.
pub fn parse_family_id(s: &str) -> Result<u32, UnknownFamily> {
    if let Ok(family) = s.parse::<Family>() {
        return Ok(family.id());
    }
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| UnknownFamily(s.to_string()))
}

/// Where to look for ROM in an ELF file and how much of it to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomOptions {
    /// ELF contents at or above this address are not ROM.
    pub flash_end: u64,
    pub read_limit: u64,
}

impl Default for RomOptions {
    fn default() -> Self {
        Self {
            flash_end: DEFAULT_FLASH_END,
            read_limit: DEFAULT_READ_LIMIT,
        }
    }
}

/// A flat memory image and the address its first byte lives at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rom {
    pub base: u64,
    pub data: Vec<u8>,
}

impl Rom {
    /// Offset of the first block start marker.
    pub fn first_block(&self) -> Result<usize, ChainError> {
        find_next_block(&self.data).map(|range| range.start)
    }

    /// Walks the chain entered at the first block.
    pub fn walk(&self) -> Result<ChainWalker<'_>, ChainError> {
        Ok(ChainWalker::new(&self.data, self.first_block()?))
    }

    pub fn blocks(&self) -> Result<Vec<ChainBlock>, ChainError> {
        walk_chain(&self.data, self.first_block()?)
    }

    pub fn address_of(&self, offset: usize) -> u64 {
        self.base + offset as u64
    }
}

#[derive(Error, Debug)]
pub enum PicobinError {
    #[error("Failed to extract ROM from elf")]
    Elf(#[from] ElfRomError),
    #[error("Failed to walk block chain")]
    Chain(#[from] ChainError),
    #[error("UF2 error")]
    Uf2(#[from] Uf2Error),
    #[error("Flash size {size} too large, limit is {limit}")]
    RomTooLarge { size: u64, limit: u64 },
    #[error("Address {0:#x} overflows the 32 bit UF2 address space")]
    RomAddressOverflow(u64),
    #[error("Failed to read ELF ROM completely ({read}/{size})")]
    RomIncomplete { read: usize, size: usize },
}

pub fn open_elf<T: Read + Seek>(
    input: T,
    options: &RomOptions,
) -> Result<FirmwareElf<T>, PicobinError> {
    Ok(FirmwareElf::open(input, options.flash_end)?)
}

/// The ROM of an ELF file, clamped to the read limit.
pub fn elf_rom<T: Read + Seek>(
    elf: &mut FirmwareElf<T>,
    options: &RomOptions,
) -> Result<Rom, PicobinError> {
    let rom = elf.read_rom(options.read_limit)?;
    if let Err(err) = elf.ensure_rom_contiguous(elf.rom_range()?) {
        warn!("{}", err);
    }
    Ok(rom)
}

/// The complete ROM of an ELF file, as it will be written to flash.
pub fn elf_flash_image<T: Read + Seek>(
    elf: &mut FirmwareElf<T>,
    options: &RomOptions,
) -> Result<Rom, PicobinError> {
    let range = elf.rom_range()?;
    let size = range.end - range.start;
    if size > options.read_limit {
        return Err(PicobinError::RomTooLarge {
            size,
            limit: options.read_limit,
        });
    }
    if range.start > u32::MAX as u64 {
        return Err(PicobinError::RomAddressOverflow(range.start));
    }

    let mut data = vec![0; size.assert_into()];
    let read = elf.read_rom_at(&mut data, range.start)?;
    if read != data.len() {
        return Err(PicobinError::RomIncomplete {
            read,
            size: data.len(),
        });
    }

    Ok(Rom {
        base: range.start,
        data,
    })
}

/// Writes `rom` as UF2 blocks tagged with `family_id`. Returns the number of blocks written.
pub fn write_uf2(rom: &Rom, family_id: u32, output: impl Write) -> Result<usize, PicobinError> {
    let base = u32::try_from(rom.base).map_err(|_| PicobinError::RomAddressOverflow(rom.base))?;
    Ok(Uf2Formatter::with_family(family_id).write(&rom.data, base, output)?)
}

/// Converts a elf file into a uf2 file.
pub fn elf2uf2(
    input: impl Read + Seek,
    output: impl Write,
    options: &RomOptions,
    family_id: u32,
) -> Result<usize, PicobinError> {
    let mut elf = open_elf(input, options)?;
    let rom = elf_flash_image(&mut elf, options)?;
    info!("Using UF2 Family {:#010x}", family_id);
    write_uf2(&rom, family_id, output)
}

/// Flattens UF2 blocks into a memory image, at most `read_limit` bytes of it.
pub fn uf2_rom(blocks: &BlocksReader, read_limit: u64) -> Result<Rom, PicobinError> {
    let addrs = blocks.addrs();
    let mut size = addrs.end - addrs.start;
    if size > read_limit {
        warn!("ROM {} too large, limiting to {}", size, read_limit);
        size = read_limit;
    }

    let mut data = vec![0; size.assert_into()];
    let read = blocks.read_at(&mut data, addrs.start)?;
    data.truncate(read);

    Ok(Rom {
        base: addrs.start,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        image_def::{ExeChip, ExeCpu, ExeSecurity},
        test_elf::{ElfBuilder, FLASH_START},
        uf2::decode_blocks,
    };
    use std::io::Cursor;

    /// Two blocks 0x40 bytes apart, looping back on each other.
    fn firmware() -> Vec<u8> {
        let image_def = ImageDef::executable(ExeSecurity::Secure, ExeCpu::Arm, ExeChip::Rp2350);
        let mut data = vec![0xee; 0x80];
        let first = Block::new(vec![image_def.to_item()], 0x40).to_bytes();
        let second = Block::new(vec![Item::ignored()], -0x40).to_bytes();
        data[..first.len()].copy_from_slice(&first);
        data[0x40..0x40 + second.len()].copy_from_slice(&second);
        data
    }

    #[test]
    fn family_names() {
        assert_eq!("rp2040".parse::<Family>(), Ok(Family::RP2040));
        assert_eq!("RP2350-ARM-S".parse::<Family>(), Ok(Family::RP2350_ARM_S));
        assert!("rp2050".parse::<Family>().is_err());
        for family in Family::ALL {
            assert_eq!(family.name().parse::<Family>(), Ok(family));
            assert_eq!(Family::from_id(family.id()), Some(family));
        }
        assert_eq!(Family::default().id(), 0xe48bff59);
    }

    #[test]
    fn family_ids() {
        assert_eq!(parse_family_id("rp2350-riscv"), Ok(0xe48bff5a));
        assert_eq!(parse_family_id("0xe48bff56"), Ok(0xe48bff56));
        assert_eq!(parse_family_id("1234"), Ok(1234));
        assert_eq!(
            parse_family_id("0x1_0000_0000"),
            Err(UnknownFamily("0x1_0000_0000".to_string()))
        );
    }

    #[test]
    fn elf_to_uf2_and_back() {
        let options = RomOptions::default();
        let elf = ElfBuilder::new()
            .entry(FLASH_START as u32 + 1)
            .segment(FLASH_START, firmware(), 0x80)
            .build();

        let mut elf = open_elf(Cursor::new(elf), &options).unwrap();
        let rom = elf_rom(&mut elf, &options).unwrap();
        assert_eq!(rom.base, FLASH_START);
        assert_eq!(rom.data, firmware());

        let blocks = rom.blocks().unwrap();
        let offsets: Vec<usize> = blocks.iter().map(|b| b.offset).collect();
        assert_eq!(offsets, [0, 0x40]);
        assert_eq!(rom.address_of(blocks[1].offset), FLASH_START + 0x40);
        assert_eq!(
            blocks[0].block.items[0].to_string(),
            "ImgDef(executable, secure, ARM, RP2350)"
        );

        let mut uf2 = Vec::new();
        assert_eq!(write_uf2(&rom, Family::RP2350_ARM_S.id(), &mut uf2).unwrap(), 1);
        assert_eq!(uf2.len(), 512);

        let reader = BlocksReader::new(decode_blocks(Cursor::new(uf2)).unwrap()).unwrap();
        assert_eq!(reader.blocks()[0].family_id(), Some(0xe48bff59));
        assert_eq!(uf2_rom(&reader, options.read_limit).unwrap(), rom);
    }

    #[test]
    fn elf2uf2_writes_every_page() {
        let elf = ElfBuilder::new()
            .segment(FLASH_START, vec![0x5a; 0x300], 0x300)
            .build();
        let mut out = Vec::new();
        let written = elf2uf2(
            Cursor::new(elf),
            &mut out,
            &RomOptions::default(),
            Family::RP2040.id(),
        )
        .unwrap();
        assert_eq!(written, 3);
        assert_eq!(out.len(), 3 * 512);
    }

    #[test]
    fn flash_image_limits() {
        let elf = ElfBuilder::new()
            .segment(FLASH_START, vec![1; 0x100], 0x100)
            .build();
        let mut elf = open_elf(Cursor::new(elf), &RomOptions::default()).unwrap();
        let options = RomOptions {
            read_limit: 0x80,
            ..Default::default()
        };
        assert!(matches!(
            elf_flash_image(&mut elf, &options),
            Err(PicobinError::RomTooLarge {
                size: 0x100,
                limit: 0x80
            })
        ));
        // A clamped read still works for inspection.
        assert_eq!(elf_rom(&mut elf, &options).unwrap().data.len(), 0x80);
    }

    #[test]
    fn flash_image_with_bss_is_incomplete() {
        let elf = ElfBuilder::new()
            .segment(FLASH_START, vec![1; 0x10], 0x20)
            .build();
        let mut elf = open_elf(Cursor::new(elf), &RomOptions::default()).unwrap();
        assert!(matches!(
            elf_flash_image(&mut elf, &RomOptions::default()),
            Err(PicobinError::RomIncomplete {
                read: 0x10,
                size: 0x20
            })
        ));
    }

    #[test]
    fn rom_without_blocks() {
        let rom = Rom {
            base: FLASH_START,
            data: vec![0; 64],
        };
        assert_eq!(rom.blocks(), Err(ChainError::NoStartMarker));
        assert!(rom.walk().is_err());
    }
}
