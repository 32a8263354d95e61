//! The image def item, which tells the boot ROM what kind of image a block describes.
//!
//! It is a single word item: the byte that narrow items leave free in their size field
//! carries the image type and security, the type specific byte carries CPU, chip and the
//! try-before-you-buy flag.

use std::fmt;

use crate::item::{Item, ItemSize, ItemType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Invalid,
    Executable,
    Data,
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExeSecurity {
    Unspecified,
    NonSecure,
    Secure,
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExeCpu {
    Arm,
    RiscV,
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExeChip {
    Rp2040,
    Rp2350,
    Unknown(u8),
}

impl ImageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0 => Self::Invalid,
            1 => Self::Executable,
            2 => Self::Data,
            other => Self::Unknown(other),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Invalid => 0,
            Self::Executable => 1,
            Self::Data => 2,
            Self::Unknown(bits) => bits & 0b111,
        }
    }
}

impl ExeSecurity {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Unspecified,
            1 => Self::NonSecure,
            2 => Self::Secure,
            other => Self::Unknown(other),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::NonSecure => 1,
            Self::Secure => 2,
            Self::Unknown(bits) => bits & 0b11,
        }
    }
}

impl ExeCpu {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0 => Self::Arm,
            1 => Self::RiscV,
            other => Self::Unknown(other),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Arm => 0,
            Self::RiscV => 1,
            Self::Unknown(bits) => bits & 0b111,
        }
    }
}

impl ExeChip {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0 => Self::Rp2040,
            1 => Self::Rp2350,
            other => Self::Unknown(other),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Rp2040 => 0,
            Self::Rp2350 => 1,
            Self::Unknown(bits) => bits & 0b111,
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => f.write_str("invalid"),
            Self::Executable => f.write_str("executable"),
            Self::Data => f.write_str("data"),
            Self::Unknown(bits) => write!(f, "ImageType({})", bits),
        }
    }
}

impl fmt::Display for ExeSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => f.write_str("unspecified"),
            Self::NonSecure => f.write_str("non-secure"),
            Self::Secure => f.write_str("secure"),
            Self::Unknown(bits) => write!(f, "ExeSecurity({})", bits),
        }
    }
}

impl fmt::Display for ExeCpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arm => f.write_str("ARM"),
            Self::RiscV => f.write_str("RISCV"),
            Self::Unknown(bits) => write!(f, "ExeCpu({})", bits),
        }
    }
}

impl fmt::Display for ExeChip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rp2040 => f.write_str("RP2040"),
            Self::Rp2350 => f.write_str("RP2350"),
            Self::Unknown(bits) => write!(f, "ExeChip({})", bits),
        }
    }
}

const TRY_BEFORE_YOU_BUY: u8 = 1 << 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDef {
    pub image_type: ImageType,
    pub security: ExeSecurity,
    pub cpu: ExeCpu,
    pub chip: ExeChip,
    pub try_before_you_buy: bool,
}

impl ImageDef {
    pub fn executable(security: ExeSecurity, cpu: ExeCpu, chip: ExeChip) -> Self {
        Self {
            image_type: ImageType::Executable,
            security,
            cpu,
            chip,
            try_before_you_buy: false,
        }
    }

    /// Interprets `item`, or returns `None` if it is not a one word image def.
    pub fn from_item(item: &Item) -> Option<Self> {
        let special = match (item.item_type, item.size) {
            (ItemType::ImageDef, ItemSize::Narrow { words: 1, special }) => special,
            _ => return None,
        };
        if !item.data.is_empty() {
            return None;
        }

        Some(Self {
            image_type: ImageType::from_bits(special),
            security: ExeSecurity::from_bits(special >> 4),
            cpu: ExeCpu::from_bits(item.type_data),
            chip: ExeChip::from_bits(item.type_data >> 4),
            try_before_you_buy: item.type_data & TRY_BEFORE_YOU_BUY != 0,
        })
    }

    pub fn to_item(&self) -> Item {
        let tbyb = if self.try_before_you_buy {
            TRY_BEFORE_YOU_BUY
        } else {
            0
        };
        Item {
            item_type: ItemType::ImageDef,
            size: ItemSize::Narrow {
                words: 1,
                special: self.image_type.bits() | self.security.bits() << 4,
            },
            type_data: self.cpu.bits() | self.chip.bits() << 4 | tbyb,
            data: Vec::new(),
        }
    }
}

impl fmt::Display for ImageDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ImgDef({}, {}, {}, {}",
            self.image_type, self.security, self.cpu, self.chip
        )?;
        if self.try_before_you_buy {
            f.write_str(", TBYB")?;
        }
        f.write_str(")")
    }
}
