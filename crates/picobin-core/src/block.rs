use std::fmt;

use thiserror::Error;

use crate::item::{Item, ItemError, ItemType, ITEM_HEADER_SIZE};

// Chosen to be very unlikely to appear in ARM machine code. Little endian like everything else.
pub const BLOCK_MARKER_START: u32 = 0xffff_ded3;
pub const BLOCK_MARKER_END: u32 = 0xab12_3579;

/// Start marker, last item, link and end marker.
pub const MIN_BLOCK_SIZE: usize = 4 + ITEM_HEADER_SIZE + 4 + 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("buffer of {available} bytes is shorter than the minimum block size")]
    TruncatedInput { available: usize },
    #[error("not start of block, missing start marker")]
    MissingStartMarker,
    #[error("bad item {index}: {source}")]
    BadItem { index: usize, source: ItemError },
    #[error("found no last item type")]
    MissingTerminator,
    #[error("expected last item size {expected} words, got {found}")]
    TerminatorSizeMismatch { expected: usize, found: usize },
    #[error("short buffer, unable to parse block link/footer")]
    TruncatedTail,
    #[error("block footer {found:#010x} does not match end marker")]
    MissingEndMarker { found: u32 },
    #[error("inconsistency in block size calculation, got {computed}, want {consumed}")]
    InternalInconsistency { computed: usize, consumed: usize },
    #[error("expected {expected} size, got {found}")]
    SizeInconsistent { expected: usize, found: usize },
    #[error("block link {0} overflows i32")]
    LinkOverflow(i64),
    #[error("block link {0} points to memory inside itself or to impossible block")]
    LinkSelfOverlap(i64),
    #[error("block item {index} is a last item")]
    ContainsTerminatorTag { index: usize },
    #[error("block item {index} ({item}): {source}")]
    InvalidItem {
        index: usize,
        item: String,
        source: ItemError,
    },
    #[error("block items span {words} words, more than the last item can record")]
    TooManyWords { words: usize },
}

/// A full block. The last item is framing and never part of `items`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub items: Vec<Item>,
    /// Position in bytes of the next block's start marker relative to this block's start
    /// marker. 0 loops back to this block, so a lone block forms a chain by itself.
    pub link: i64,
}

impl Block {
    pub fn new(items: Vec<Item>, link: i64) -> Self {
        Self { items, link }
    }

    /// Size of the encoded block in bytes, from start marker to end marker.
    pub fn size(&self) -> usize {
        MIN_BLOCK_SIZE + self.items.iter().map(Item::size_bytes).sum::<usize>()
    }

    /// Word count the last item records.
    pub fn item_words(&self) -> usize {
        self.items.iter().map(Item::size_words).sum()
    }

    /// Performs every static check possible on the block and its items.
    pub fn validate(&self) -> Result<(), BlockError> {
        let size = self.size();
        if i32::try_from(self.link).is_err() {
            return Err(BlockError::LinkOverflow(self.link));
        }
        let size_signed = i64::try_from(size).unwrap_or(i64::MAX);
        if self.link != 0 && self.link < size_signed && self.link > -(MIN_BLOCK_SIZE as i64) {
            return Err(BlockError::LinkSelfOverlap(self.link));
        }

        let mut expected = MIN_BLOCK_SIZE;
        for (index, item) in self.items.iter().enumerate() {
            if item.item_type.as_raw() == ItemType::Last.as_raw() {
                return Err(BlockError::ContainsTerminatorTag { index });
            }
            item.validate()
                .map_err(|source| BlockError::InvalidItem {
                    index,
                    item: item.to_string(),
                    source,
                })?;
            expected += ITEM_HEADER_SIZE + item.data.len();
        }
        if size != expected {
            return Err(BlockError::SizeInconsistent {
                expected,
                found: size,
            });
        }

        let words = self.item_words();
        if words > u16::MAX as usize {
            return Err(BlockError::TooManyWords { words });
        }

        Ok(())
    }

    /// Decodes the block at the start of `buf`, returning it with the bytes read up to and
    /// including the end marker.
    ///
    /// Decoding only checks framing. Call [`Block::validate`] for the remaining checks.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), BlockError> {
        if buf.len() < MIN_BLOCK_SIZE {
            return Err(BlockError::TruncatedInput {
                available: buf.len(),
            });
        }
        if read_u32(buf, 0) != Some(BLOCK_MARKER_START) {
            return Err(BlockError::MissingStartMarker);
        }

        let mut n = 4;
        let mut items = Vec::new();
        loop {
            if n >= buf.len() {
                return Err(BlockError::MissingTerminator);
            }
            let (item, len) = Item::decode(&buf[n..]).map_err(|source| BlockError::BadItem {
                index: items.len(),
                source,
            })?;
            n += len;

            if item.item_type == ItemType::Last {
                let expected = (n - 4 - ITEM_HEADER_SIZE) / 4;
                if item.size_words() != expected {
                    return Err(BlockError::TerminatorSizeMismatch {
                        expected,
                        found: item.size_words(),
                    });
                }
                break;
            }
            items.push(item);
        }

        let (link, footer) = match (read_u32(buf, n), read_u32(buf, n + 4)) {
            (Some(link), Some(footer)) => (link as i32 as i64, footer),
            _ => return Err(BlockError::TruncatedTail),
        };
        if footer != BLOCK_MARKER_END {
            return Err(BlockError::MissingEndMarker { found: footer });
        }
        n += 8;

        let block = Self { items, link };
        let computed = block.size();
        if computed != n {
            return Err(BlockError::InternalInconsistency {
                computed,
                consumed: n,
            });
        }

        Ok((block, n))
    }

    /// Appends the encoded block to `dst` without checking it. Call [`Block::validate`]
    /// first to make sure the output is sane.
    pub fn append_to(&self, dst: &mut Vec<u8>) {
        dst.reserve(self.size());
        dst.extend_from_slice(&BLOCK_MARKER_START.to_le_bytes());
        for item in &self.items {
            item.append_to(dst);
        }
        // Truncates like every other unchecked field.
        Item::last(self.item_words() as u16).append_to(dst);
        dst.extend_from_slice(&(self.link as i32).to_le_bytes());
        dst.extend_from_slice(&BLOCK_MARKER_END.to_le_bytes());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.append_to(&mut bytes);
        bytes
    }
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", item)?;
        }
        write!(f, "] link={}", self.link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_def::{ExeChip, ExeCpu, ExeSecurity, ImageDef};
    use crate::item::ItemSize;

    fn image_def_block() -> Block {
        let image_def = Item::new(ItemType::ImageDef, 0, vec![0; 4]).unwrap();
        Block::new(vec![image_def], 0)
    }

    #[test]
    fn single_item_block_encodes_to_24_bytes() {
        let block = image_def_block();
        block.validate().unwrap();

        let bytes = block.to_bytes();
        assert_eq!(bytes.len(), 24);
        assert_eq!(block.size(), 24);
        #[rustfmt::skip]
        assert_eq!(
            bytes,
            [
                0xd3, 0xde, 0xff, 0xff,
                0x42, 0x02, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x00,
                0xff, 0x02, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x00,
                0x79, 0x35, 0x12, 0xab,
            ]
        );

        assert_eq!(Block::decode(&bytes), Ok((block, 24)));
    }

    #[test]
    fn round_trip_keeps_trailing_bytes_out() {
        let block = Block::new(
            vec![
                ImageDef::executable(ExeSecurity::Secure, ExeCpu::Arm, ExeChip::Rp2350).to_item(),
                Item::new(ItemType::EntryPoint, 0, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap(),
                Item::ignored(),
            ],
            -0x100,
        );
        block.validate().unwrap();

        let mut bytes = block.to_bytes();
        let size = bytes.len();
        bytes.extend_from_slice(&[0xaa; 16]);

        let (decoded, consumed) = Block::decode(&bytes).unwrap();
        assert_eq!(consumed, size);
        assert_eq!(decoded, block);
        assert_eq!(decoded.size(), MIN_BLOCK_SIZE + 4 + 12 + 4);
    }

    #[test]
    fn terminator_records_item_words() {
        let block = Block::new(
            vec![
                Item::new(ItemType::Salt, 0, vec![0; 16]).unwrap(),
                Item::new(ItemType::Version, 0, vec![0; 4]).unwrap(),
            ],
            0,
        );
        let bytes = block.to_bytes();
        let last = &bytes[4 + 20 + 8..4 + 20 + 8 + 4];
        assert_eq!(last, [0xff, 7, 0, 0]);
        assert_eq!(block.item_words() * 4, 28);
    }

    #[test]
    fn link_self_overlap() {
        let mut block = image_def_block();

        block.link = 1;
        assert_eq!(block.validate(), Err(BlockError::LinkSelfOverlap(1)));
        block.link = 23;
        assert_eq!(block.validate(), Err(BlockError::LinkSelfOverlap(23)));
        block.link = -15;
        assert_eq!(block.validate(), Err(BlockError::LinkSelfOverlap(-15)));

        block.link = 0;
        block.validate().unwrap();
        block.link = 24;
        block.validate().unwrap();
        // A minimum sized block can sit right before this one.
        block.link = -16;
        block.validate().unwrap();
    }

    #[test]
    fn link_overflow() {
        let mut block = image_def_block();
        block.link = i32::MAX as i64 + 1;
        assert_eq!(
            block.validate(),
            Err(BlockError::LinkOverflow(i32::MAX as i64 + 1))
        );
        block.link = i32::MIN as i64;
        block.validate().unwrap();
    }

    #[test]
    fn last_item_must_not_be_listed() {
        let block = Block::new(vec![Item::ignored(), Item::last(1)], 0);
        assert_eq!(
            block.validate(),
            Err(BlockError::ContainsTerminatorTag { index: 1 })
        );
    }

    #[test]
    fn unknown_tag_holding_the_last_tag_is_rejected() {
        let disguised = Item {
            item_type: ItemType::Unknown(0x7f),
            size: ItemSize::Wide(1),
            type_data: 0,
            data: Vec::new(),
        };
        let block = Block::new(vec![Item::ignored(), disguised], 0);
        assert_eq!(
            block.validate(),
            Err(BlockError::ContainsTerminatorTag { index: 1 })
        );
    }

    #[test]
    fn unknown_tag_holding_a_known_tag_is_rejected() {
        let disguised = Item {
            item_type: ItemType::Unknown(0x42),
            size: ItemSize::Narrow {
                words: 1,
                special: 0,
            },
            type_data: 0,
            data: Vec::new(),
        };
        let block = Block::new(vec![disguised], 0);
        assert!(matches!(
            block.validate(),
            Err(BlockError::InvalidItem {
                index: 0,
                source: ItemError::NonCanonicalType(ItemType::Unknown(0x42)),
                ..
            })
        ));
    }

    #[test]
    fn unknown_tag_round_trips() {
        let item = Item::new(ItemType::Unknown(0x13), 7, vec![1; 8]).unwrap();
        let block = Block::new(vec![item], 0);
        block.validate().unwrap();
        let bytes = block.to_bytes();
        assert_eq!(Block::decode(&bytes), Ok((block, bytes.len())));
    }

    #[test]
    fn invalid_item_is_reported_with_index() {
        let mut item = Item::new(ItemType::HashValue, 0, vec![0; 8]).unwrap();
        item.data.truncate(4);
        let block = Block::new(vec![Item::ignored(), item], 0);
        assert_eq!(
            block.validate(),
            Err(BlockError::InvalidItem {
                index: 1,
                item: "Item(hash value, size=12)".to_string(),
                source: ItemError::SizeMismatch {
                    declared: 12,
                    data: 4
                },
            })
        );
    }

    #[test]
    fn decode_short_buffer() {
        assert_eq!(
            Block::decode(&[0xd3, 0xde, 0xff, 0xff]),
            Err(BlockError::TruncatedInput { available: 4 })
        );
        assert_eq!(
            Block::decode(&[]),
            Err(BlockError::TruncatedInput { available: 0 })
        );
    }

    #[test]
    fn decode_missing_start_marker() {
        let mut bytes = image_def_block().to_bytes();
        bytes[0] = 0;
        assert_eq!(Block::decode(&bytes), Err(BlockError::MissingStartMarker));
    }

    #[test]
    fn decode_missing_terminator() {
        let mut bytes = BLOCK_MARKER_START.to_le_bytes().to_vec();
        for _ in 0..4 {
            Item::ignored().append_to(&mut bytes);
        }
        assert_eq!(Block::decode(&bytes), Err(BlockError::MissingTerminator));
    }

    #[test]
    fn decode_bad_item() {
        let mut bytes = BLOCK_MARKER_START.to_le_bytes().to_vec();
        Item::ignored().append_to(&mut bytes);
        // Declares 4 words with only 3 words of buffer left.
        bytes.extend_from_slice(&[0x03, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            Block::decode(&bytes),
            Err(BlockError::BadItem {
                index: 1,
                source: ItemError::TruncatedInput {
                    needed: 16,
                    available: 12
                }
            })
        );
    }

    #[test]
    fn decode_terminator_size_mismatch() {
        let mut bytes = image_def_block().to_bytes();
        bytes[13] = 3;
        assert_eq!(
            Block::decode(&bytes),
            Err(BlockError::TerminatorSizeMismatch {
                expected: 2,
                found: 3
            })
        );
    }

    #[test]
    fn decode_truncated_tail() {
        let bytes = image_def_block().to_bytes();
        assert_eq!(
            Block::decode(&bytes[..20]),
            Err(BlockError::TruncatedTail)
        );
    }

    #[test]
    fn decode_missing_end_marker() {
        let mut bytes = image_def_block().to_bytes();
        bytes[23] = 0;
        assert_eq!(
            Block::decode(&bytes),
            Err(BlockError::MissingEndMarker { found: 0x0012_3579 })
        );
    }

    #[test]
    fn decode_negative_link() {
        let mut block = image_def_block();
        block.link = -48;
        let (decoded, _) = Block::decode(&block.to_bytes()).unwrap();
        assert_eq!(decoded.link, -48);
    }

    #[test]
    fn display() {
        let block = Block::new(vec![Item::ignored()], 0x40);
        assert_eq!(block.to_string(), "[Item(ignored, size=4)] link=64");
    }
}
