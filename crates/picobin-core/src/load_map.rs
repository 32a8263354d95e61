use std::fmt;

use crate::item::{Item, ItemError, ItemType};

/// Words taken by each load map entry.
pub const LOAD_MAP_ENTRY_WORDS: usize = 3;

const ABSOLUTE_FLAG: u8 = 1;
const MAX_ENTRIES: usize = 0x7f;

/// A binary blob to be loaded. All addresses must be word aligned and sizes a multiple of 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadMapEntry {
    /// Storage start relative to this word, or the absolute storage start in an absolute map.
    pub storage_start: u32,
    /// Absolute runtime start address.
    pub runtime_start: u32,
    /// Size in bytes, or the absolute storage end in an absolute map.
    pub size_or_end: u32,
}

/// Describes what to hash and what to copy before an image runs, much like an ELF program
/// header table.
///
/// For a packaged binary the entries tell the boot ROM where to load code and data. For a
/// hashed or signed binary the runtime addresses and sizes select what is covered by the
/// hash or signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadMap {
    pub absolute: bool,
    pub entries: Vec<LoadMapEntry>,
}

impl LoadMap {
    /// Interprets `item`, or returns `None` when it is not a load map or its entry count
    /// disagrees with its size.
    pub fn from_item(item: &Item) -> Option<Self> {
        if item.item_type != ItemType::LoadMap || item.validate().is_err() {
            return None;
        }
        let count = (item.type_data >> 1) as usize;
        if item.size_words() != 1 + count * LOAD_MAP_ENTRY_WORDS {
            return None;
        }

        let entries = item
            .data
            .chunks_exact(LOAD_MAP_ENTRY_WORDS * 4)
            .map(|entry| LoadMapEntry {
                storage_start: read_word(entry, 0),
                runtime_start: read_word(entry, 1),
                size_or_end: read_word(entry, 2),
            })
            .collect();

        Some(Self {
            absolute: item.type_data & ABSOLUTE_FLAG != 0,
            entries,
        })
    }

    pub fn to_item(&self) -> Result<Item, ItemError> {
        if self.entries.len() > MAX_ENTRIES {
            return Err(ItemError::FieldOverflow {
                field: "load map entry count",
                value: self.entries.len(),
            });
        }

        let mut data = Vec::with_capacity(self.entries.len() * LOAD_MAP_ENTRY_WORDS * 4);
        for entry in &self.entries {
            data.extend_from_slice(&entry.storage_start.to_le_bytes());
            data.extend_from_slice(&entry.runtime_start.to_le_bytes());
            data.extend_from_slice(&entry.size_or_end.to_le_bytes());
        }
        let flags = (self.entries.len() as u8) << 1 | u8::from(self.absolute);

        Item::new(ItemType::LoadMap, flags, data)
    }
}

fn read_word(entry: &[u8], index: usize) -> u32 {
    let mut word = [0; 4];
    word.copy_from_slice(&entry[index * 4..index * 4 + 4]);
    u32::from_le_bytes(word)
}

impl fmt::Display for LoadMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LoadMap(abs={}, entries={})",
            self.absolute,
            self.entries.len()
        )
    }
}
