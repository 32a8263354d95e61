//! Following the links between the blocks of a flat memory image.
//!
//! Blocks live at fixed offsets of the image and each link is relative to the start of the
//! block holding it. A well formed chain always closes on the block it was entered at.

use std::{collections::HashSet, iter::FusedIterator, ops::Range};

use log::{debug, trace};
use thiserror::Error;

use crate::block::{Block, BlockError, BLOCK_MARKER_END, BLOCK_MARKER_START};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("block start marker not found")]
    NoStartMarker,
    #[error("end marker found at offset {end:#x} with no start marker")]
    DanglingEndMarker { end: usize },
    #[error("block end marker not found after start marker at offset {start:#x}")]
    NoEndMarker { start: usize },
    #[error("decoding block {index} at offset {offset:#x}: {source}")]
    BadBlock {
        index: usize,
        offset: usize,
        source: BlockError,
    },
    #[error("odd cyclic block at offset {offset:#x}, links back to {target:#x}")]
    InvalidCycle { offset: usize, target: usize },
    #[error("block at offset {offset:#x} links {link} bytes, out of bounds")]
    LinkOutOfBounds { offset: usize, link: i64 },
}

/// Locates the first block of `buf` by its markers.
///
/// Returns the byte range from its start marker up to and including the first end marker
/// after it.
pub fn find_next_block(buf: &[u8]) -> Result<Range<usize>, ChainError> {
    let start = match find_marker(buf, BLOCK_MARKER_START) {
        Some(start) => start,
        None => {
            return Err(match find_marker(buf, BLOCK_MARKER_END) {
                Some(end) => ChainError::DanglingEndMarker { end },
                None => ChainError::NoStartMarker,
            })
        }
    };
    let end = find_marker(&buf[start..], BLOCK_MARKER_END)
        .ok_or(ChainError::NoEndMarker { start })?;

    Ok(start..start + end + 4)
}

fn find_marker(buf: &[u8], marker: u32) -> Option<usize> {
    let marker = marker.to_le_bytes();
    buf.windows(marker.len()).position(|window| window == marker)
}

/// A block and the offset of its start marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlock {
    pub offset: usize,
    pub block: Block,
}

/// Iterator over the blocks of a chain, in link order.
///
/// Stops after the block whose link closes the loop, or after the first error.
pub struct ChainWalker<'a> {
    buf: &'a [u8],
    first: usize,
    next: Option<usize>,
    visited: HashSet<usize>,
    index: usize,
}

impl<'a> ChainWalker<'a> {
    pub fn new(buf: &'a [u8], first: usize) -> Self {
        Self {
            buf,
            first,
            next: Some(first),
            visited: HashSet::from([first]),
            index: 0,
        }
    }

    fn step(&mut self, offset: usize) -> Result<ChainBlock, ChainError> {
        let window = self.buf.get(offset..).unwrap_or(&[]);
        let (block, size) = Block::decode(window).map_err(|source| ChainError::BadBlock {
            index: self.index,
            offset,
            source,
        })?;
        trace!(
            "Block {} at {:#x}: {} bytes, link {}",
            self.index,
            offset,
            size,
            block.link
        );

        let next = i64::try_from(offset)
            .ok()
            .and_then(|offset| offset.checked_add(block.link))
            .and_then(|next| usize::try_from(next).ok())
            .ok_or(ChainError::LinkOutOfBounds {
                offset,
                link: block.link,
            })?;

        if self.visited.contains(&next) {
            if next != self.first {
                return Err(ChainError::InvalidCycle {
                    offset,
                    target: next,
                });
            }
            debug!("Chain closed after {} blocks", self.index + 1);
        } else {
            self.visited.insert(next);
            self.next = Some(next);
        }
        self.index += 1;

        Ok(ChainBlock { offset, block })
    }
}

impl Iterator for ChainWalker<'_> {
    type Item = Result<ChainBlock, ChainError>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next.take()?;
        Some(self.step(offset))
    }
}

impl FusedIterator for ChainWalker<'_> {}

/// Decodes every block of the chain entered at `first`.
pub fn walk_chain(buf: &[u8], first: usize) -> Result<Vec<ChainBlock>, ChainError> {
    ChainWalker::new(buf, first).collect()
}
