use std::fmt;

use thiserror::Error;

use crate::{image_def::ImageDef, load_map::LoadMap};

/// Size in bytes of the header every item starts with.
pub const ITEM_HEADER_SIZE: usize = 4;

/// Bit 7 of the first header byte selects a two byte size field.
const SIZE_FLAG_WIDE: u8 = 0x80;
const ITEM_TYPE_MASK: u8 = 0x7f;

/// The kind of an item, stored in the low 7 bits of its first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    VectorTable,
    RollingWindowDelta,
    LoadMap,
    Signature,
    PartitionTable,
    Salt,
    NextBlockOffset,
    ImageDef,
    EntryPoint,
    HashDef,
    Version,
    HashValue,
    /// Padding, always encoded with a two byte size.
    Ignored,
    /// Block terminator, always encoded with a two byte size.
    Last,
    /// Any tag without a known meaning; kept so it can be encoded back verbatim.
    Unknown(u8),
}

impl ItemType {
    pub fn from_raw(raw: u8) -> Self {
        match raw & ITEM_TYPE_MASK {
            0x03 => Self::VectorTable,
            0x05 => Self::RollingWindowDelta,
            0x06 => Self::LoadMap,
            0x09 => Self::Signature,
            0x0a => Self::PartitionTable,
            0x0c => Self::Salt,
            0x41 => Self::NextBlockOffset,
            0x42 => Self::ImageDef,
            0x44 => Self::EntryPoint,
            0x47 => Self::HashDef,
            0x48 => Self::Version,
            0x4b => Self::HashValue,
            0x7e => Self::Ignored,
            0x7f => Self::Last,
            other => Self::Unknown(other),
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            Self::VectorTable => 0x03,
            Self::RollingWindowDelta => 0x05,
            Self::LoadMap => 0x06,
            Self::Signature => 0x09,
            Self::PartitionTable => 0x0a,
            Self::Salt => 0x0c,
            Self::NextBlockOffset => 0x41,
            Self::ImageDef => 0x42,
            Self::EntryPoint => 0x44,
            Self::HashDef => 0x47,
            Self::Version => 0x48,
            Self::HashValue => 0x4b,
            Self::Ignored => 0x7e,
            Self::Last => 0x7f,
            Self::Unknown(raw) => raw & ITEM_TYPE_MASK,
        }
    }

    /// Human readable name, `None` for unknown tags.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::VectorTable => "vector table",
            Self::RollingWindowDelta => "rolling window delta",
            Self::LoadMap => "load map",
            Self::Signature => "signature",
            Self::PartitionTable => "partition table",
            Self::Salt => "salt",
            Self::NextBlockOffset => "next block offset",
            Self::ImageDef => "image def",
            Self::EntryPoint => "entry point",
            Self::HashDef => "hash def",
            Self::Version => "version",
            Self::HashValue => "hash value",
            Self::Ignored => "ignored",
            Self::Last => "last",
            Self::Unknown(_) => return None,
        };
        Some(name)
    }

    /// Item types that must use the two byte size form.
    pub fn is_always_wide(self) -> bool {
        matches!(self, Self::Ignored | Self::Last)
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "ItemType({:#04x})", self.as_raw()),
        }
    }
}

/// Size field of an item header, counted in 4 byte words including the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSize {
    /// One byte word count. The second size byte is free for tag specific data.
    Narrow { words: u8, special: u8 },
    /// Two byte word count.
    Wide(u16),
}

impl ItemSize {
    /// Picks the narrowest form able to hold `words`, unless `wide` is forced.
    pub fn for_words(words: usize, wide: bool) -> Option<Self> {
        if !wide {
            if let Ok(words) = u8::try_from(words) {
                return Some(Self::Narrow { words, special: 0 });
            }
        }
        u16::try_from(words).ok().map(Self::Wide)
    }

    pub fn words(self) -> usize {
        match self {
            Self::Narrow { words, .. } => words as usize,
            Self::Wide(words) => words as usize,
        }
    }

    pub fn bytes(self) -> usize {
        self.words() * 4
    }

    pub fn is_wide(self) -> bool {
        matches!(self, Self::Wide(_))
    }

    /// The tag specific byte carried by narrow sizes.
    pub fn special(self) -> Option<u8> {
        match self {
            Self::Narrow { special, .. } => Some(special),
            Self::Wide(_) => None,
        }
    }

    fn from_raw(wide: bool, raw: [u8; 2]) -> Self {
        if wide {
            Self::Wide(u16::from_le_bytes(raw))
        } else {
            Self::Narrow {
                words: raw[0],
                special: raw[1],
            }
        }
    }

    fn to_raw(self) -> [u8; 2] {
        match self {
            Self::Narrow { words, special } => [words, special],
            Self::Wide(words) => words.to_le_bytes(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ItemError {
    #[error("item needs {needed} bytes, only {available} available")]
    TruncatedInput { needed: usize, available: usize },
    #[error("{item_type} item size {size} is shorter than its own header")]
    MalformedSize { item_type: ItemType, size: usize },
    #[error("item size {declared}, but have {data} bytes of data")]
    SizeMismatch { declared: usize, data: usize },
    #[error("item data of {0} bytes is not a whole number of words")]
    UnalignedData(usize),
    #[error("item data of {0} bytes overflows the size field")]
    DataTooLarge(usize),
    #[error("{field} {value} does not fit in its item field")]
    FieldOverflow { field: &'static str, value: usize },
    #[error("{0:?} does not round trip through its tag byte")]
    NonCanonicalType(ItemType),
}

/// A single tagged record of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub item_type: ItemType,
    pub size: ItemSize,
    pub type_data: u8,
    pub data: Vec<u8>,
}

impl Item {
    /// Builds an item around `data`, choosing the size form from its length.
    pub fn new(item_type: ItemType, type_data: u8, data: Vec<u8>) -> Result<Self, ItemError> {
        if data.len() % 4 != 0 {
            return Err(ItemError::UnalignedData(data.len()));
        }
        let words = 1 + data.len() / 4;
        let size = ItemSize::for_words(words, item_type.is_always_wide())
            .ok_or(ItemError::DataTooLarge(data.len()))?;

        Ok(Self {
            item_type,
            size,
            type_data,
            data,
        })
    }

    /// A one word padding item.
    pub fn ignored() -> Self {
        Self {
            item_type: ItemType::Ignored,
            size: ItemSize::Wide(1),
            type_data: 0,
            data: Vec::new(),
        }
    }

    /// The block terminator recording `words` words of preceding items.
    pub(crate) fn last(words: u16) -> Self {
        Self {
            item_type: ItemType::Last,
            size: ItemSize::Wide(words),
            type_data: 0,
            data: Vec::new(),
        }
    }

    /// Decodes the item at the start of `buf` and returns it with the number of bytes it spans.
    ///
    /// The size of a last item is a word count of the block's other items, so it always
    /// spans exactly its header.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ItemError> {
        let header: [u8; ITEM_HEADER_SIZE] = buf
            .get(..ITEM_HEADER_SIZE)
            .and_then(|header| header.try_into().ok())
            .ok_or(ItemError::TruncatedInput {
                needed: ITEM_HEADER_SIZE,
                available: buf.len(),
            })?;

        let mut item = Self {
            item_type: ItemType::from_raw(header[0]),
            size: ItemSize::from_raw(header[0] & SIZE_FLAG_WIDE != 0, [header[1], header[2]]),
            type_data: header[3],
            data: Vec::new(),
        };

        if item.item_type == ItemType::Last {
            return Ok((item, ITEM_HEADER_SIZE));
        }

        let size = item.size_bytes();
        if size > buf.len() {
            return Err(ItemError::TruncatedInput {
                needed: size,
                available: buf.len(),
            });
        } else if size < ITEM_HEADER_SIZE {
            return Err(ItemError::MalformedSize {
                item_type: item.item_type,
                size,
            });
        }
        item.data = buf[ITEM_HEADER_SIZE..size].to_vec();

        Ok((item, size))
    }

    pub fn validate(&self) -> Result<(), ItemError> {
        if ItemType::from_raw(self.item_type.as_raw()) != self.item_type {
            return Err(ItemError::NonCanonicalType(self.item_type));
        }
        let declared = self.size_bytes();
        if declared != ITEM_HEADER_SIZE + self.data.len() {
            return Err(ItemError::SizeMismatch {
                declared,
                data: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn size_words(&self) -> usize {
        self.size.words()
    }

    /// Size in bytes as declared by the header, header included.
    pub fn size_bytes(&self) -> usize {
        self.size.bytes()
    }

    pub fn header_bytes(&self) -> [u8; ITEM_HEADER_SIZE] {
        let flag = if self.size.is_wide() { SIZE_FLAG_WIDE } else { 0 };
        let [size0, size1] = self.size.to_raw();
        [
            self.item_type.as_raw() | flag,
            size0,
            size1,
            self.type_data,
        ]
    }

    /// Appends header and data without checking them, see [`Item::validate`].
    pub fn append_to(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.header_bytes());
        dst.extend_from_slice(&self.data);
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.item_type {
            ItemType::ImageDef => {
                if let Some(image_def) = ImageDef::from_item(self) {
                    return write!(f, "{}", image_def);
                }
            }
            ItemType::LoadMap => {
                return match LoadMap::from_item(self) {
                    Some(load_map) => write!(f, "{}", load_map),
                    None => f.write_str("InvalidLoadMap()"),
                };
            }
            _ => (),
        }
        write!(f, "Item({}, size={})", self.item_type, self.size_bytes())
    }
}
