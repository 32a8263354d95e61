use std::{
    cmp::min,
    fmt,
    io::{self, Read, Write},
    mem,
    ops::Range,
};

use assert_into::AssertInto;
use log::{debug, trace};
use static_assertions::const_assert;
use thiserror::Error;
use zerocopy::{
    byteorder::{LittleEndian, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

pub const UF2_MAGIC_START0: u32 = 0x0A324655; // "UF2\n"
pub const UF2_MAGIC_START1: u32 = 0x9E5D5157;
pub const UF2_MAGIC_END: u32 = 0x0AB16F30;

pub const UF2_FLAG_NOT_MAIN_FLASH: u32 = 0x00000001;
pub const UF2_FLAG_FILE_CONTAINER: u32 = 0x00001000;
pub const UF2_FLAG_FAMILY_ID_PRESENT: u32 = 0x00002000;
pub const UF2_FLAG_MD5_PRESENT: u32 = 0x00004000;
pub const UF2_FLAG_EXTENSION_TAGS_PRESENT: u32 = 0x00008000;

pub const UF2_BLOCK_SIZE: usize = 512;
pub const UF2_MAX_PAYLOAD: usize = 476;
pub const UF2_DEFAULT_PAYLOAD: u32 = 256;

pub type Uf2BlockData = [u8; UF2_MAX_PAYLOAD];

#[derive(Error, Debug)]
pub enum Uf2Error {
    #[error("Buffer of {0} bytes too small to contain a block")]
    ShortBlock(usize),
    #[error("First word {0:#010x} is not magic0 word \"UF2\\n\"")]
    BadMagicStart0(u32),
    #[error("Second word {0:#010x} is not magic1 word")]
    BadMagicStart1(u32),
    #[error("Last word {0:#010x} is not magic end word")]
    BadMagicEnd(u32),
    #[error("Zero payload size")]
    ZeroPayload,
    #[error("Payload size {0} exceeds permissible maximum")]
    PayloadTooLarge(u32),
    #[error("Chunk size {0} too large")]
    ChunkTooLarge(u32),
    #[error("Data length {0} overflows the size field, use a family id to omit it")]
    DataTooLarge(usize),
    #[error("Data of {len} bytes at {addr:#x} overflows the 32 bit address space")]
    AddressOverflow { addr: u32, len: usize },
    #[error("No UF2 blocks")]
    NoBlocks,
    #[error("Attempted to read {addr:#x}..{end:#x}, outside of UF2 blocks")]
    OutOfBounds { addr: u64, end: u64 },
    #[error("Failed to read UF2 blocks")]
    Io(#[from] io::Error),
}

#[repr(C)]
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Uf2Block {
    // 32 byte header
    pub magic_start0: U32<LittleEndian>,
    pub magic_start1: U32<LittleEndian>,
    pub flags: U32<LittleEndian>,
    pub target_addr: U32<LittleEndian>,
    pub payload_size: U32<LittleEndian>,
    pub block_no: U32<LittleEndian>,
    pub num_blocks: U32<LittleEndian>,
    pub file_size: U32<LittleEndian>, // or familyID
    pub data: Uf2BlockData,
    pub magic_end: U32<LittleEndian>,
}

const_assert!(mem::size_of::<Uf2Block>() == UF2_BLOCK_SIZE);

impl Uf2Block {
    /// Decodes the first 512 bytes of `buf`, checking the three magic words.
    pub fn decode(buf: &[u8]) -> Result<Self, Uf2Error> {
        let bytes = buf
            .get(..UF2_BLOCK_SIZE)
            .ok_or(Uf2Error::ShortBlock(buf.len()))?;
        let block =
            Self::read_from_bytes(bytes).map_err(|_| Uf2Error::ShortBlock(buf.len()))?;

        if block.magic_start0.get() != UF2_MAGIC_START0 {
            return Err(Uf2Error::BadMagicStart0(block.magic_start0.get()));
        }
        if block.magic_start1.get() != UF2_MAGIC_START1 {
            return Err(Uf2Error::BadMagicStart1(block.magic_start1.get()));
        }
        if block.magic_end.get() != UF2_MAGIC_END {
            return Err(Uf2Error::BadMagicEnd(block.magic_end.get()));
        }

        Ok(block)
    }

    pub fn validate(&self) -> Result<(), Uf2Error> {
        match self.payload_size.get() {
            0 => Err(Uf2Error::ZeroPayload),
            size if size as usize > UF2_MAX_PAYLOAD => Err(Uf2Error::PayloadTooLarge(size)),
            _ => Ok(()),
        }
    }

    /// The payload, limited to its declared size.
    pub fn data(&self) -> Result<&[u8], Uf2Error> {
        self.validate()?;
        Ok(&self.data[..self.payload_size.get() as usize])
    }

    pub fn family_id(&self) -> Option<u32> {
        (self.flags.get() & UF2_FLAG_FAMILY_ID_PRESENT != 0).then(|| self.file_size.get())
    }

    fn address_range(&self) -> Range<u64> {
        let start = self.target_addr.get() as u64;
        start..start + self.payload_size.get() as u64
    }
}

impl fmt::Display for Uf2Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block {:2}/{:2} flags={:#x} ",
            self.block_no.get() as u64 + 1,
            self.num_blocks.get(),
            self.flags.get()
        )?;
        match self.family_id() {
            Some(family) => write!(
                f,
                "size={} family={:#x} addr={:#x}",
                self.payload_size.get(),
                family,
                self.target_addr.get()
            ),
            None => write!(
                f,
                "size={}/{} addr={:#x}",
                self.payload_size.get(),
                self.file_size.get(),
                self.target_addr.get()
            ),
        }
    }
}

/// Reads consecutive blocks until the end of `input`. A trailing partial block is ignored.
pub fn decode_blocks(mut input: impl Read) -> Result<Vec<Uf2Block>, Uf2Error> {
    let mut blocks = Vec::new();
    let mut buf = [0; UF2_BLOCK_SIZE];

    loop {
        match input.read_exact(&mut buf) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let block = Uf2Block::decode(&buf)?;
        trace!("{}", block);
        blocks.push(block);
    }

    debug!("Decoded {} UF2 blocks", blocks.len());
    Ok(blocks)
}

/// Splits flat data into UF2 blocks.
#[derive(Debug, Clone, Copy)]
pub struct Uf2Formatter {
    pub flags: u32,
    pub family_id: u32,
    /// Payload size of every block but the last. Zero selects the default of 256.
    pub chunk_size: u32,
}

impl Default for Uf2Formatter {
    fn default() -> Self {
        Self {
            flags: 0,
            family_id: 0,
            chunk_size: UF2_DEFAULT_PAYLOAD,
        }
    }
}

impl Uf2Formatter {
    pub fn with_family(family_id: u32) -> Self {
        Self {
            flags: UF2_FLAG_FAMILY_ID_PRESENT,
            family_id,
            ..Default::default()
        }
    }

    fn chunk_size(&self) -> Result<usize, Uf2Error> {
        match self.chunk_size {
            0 => Ok(UF2_DEFAULT_PAYLOAD as usize),
            size if size as usize > UF2_MAX_PAYLOAD => Err(Uf2Error::ChunkTooLarge(size)),
            size => Ok(size as usize),
        }
    }

    pub fn block_count(&self, data_len: usize) -> Result<u32, Uf2Error> {
        let count = data_len.div_ceil(self.chunk_size()?);
        u32::try_from(count).map_err(|_| Uf2Error::DataTooLarge(data_len))
    }

    /// Lays out `data` starting at `target_addr` as a sequence of blocks.
    pub fn format(&self, data: &[u8], target_addr: u32) -> Result<Vec<Uf2Block>, Uf2Error> {
        let chunk_size = self.chunk_size()?;
        let num_blocks = self.block_count(data.len())?;
        if target_addr as u64 + data.len() as u64 > u32::MAX as u64 + 1 {
            return Err(Uf2Error::AddressOverflow {
                addr: target_addr,
                len: data.len(),
            });
        }
        let file_size = if self.flags & UF2_FLAG_FAMILY_ID_PRESENT != 0 {
            self.family_id
        } else {
            u32::try_from(data.len()).map_err(|_| Uf2Error::DataTooLarge(data.len()))?
        };

        let mut addr = target_addr;
        let blocks = data
            .chunks(chunk_size)
            .enumerate()
            .map(|(block_no, chunk)| {
                let mut block_data: Uf2BlockData = [0; UF2_MAX_PAYLOAD];
                block_data[..chunk.len()].copy_from_slice(chunk);

                let block = Uf2Block {
                    magic_start0: UF2_MAGIC_START0.into(),
                    magic_start1: UF2_MAGIC_START1.into(),
                    flags: self.flags.into(),
                    target_addr: addr.into(),
                    payload_size: U32::new(chunk.len().assert_into()),
                    block_no: U32::new(block_no.assert_into()),
                    num_blocks: num_blocks.into(),
                    file_size: file_size.into(),
                    data: block_data,
                    magic_end: UF2_MAGIC_END.into(),
                };
                addr = addr.wrapping_add(chunk.len() as u32);
                block
            })
            .collect();

        Ok(blocks)
    }

    /// Writes `data` as UF2 to `output`, returning the number of blocks written.
    pub fn write(
        &self,
        data: &[u8],
        target_addr: u32,
        mut output: impl Write,
    ) -> Result<usize, Uf2Error> {
        let blocks = self.format(data, target_addr)?;
        for block in &blocks {
            debug!(
                "Page {} / {} {:#08x}",
                block.block_no.get(),
                block.num_blocks.get(),
                block.target_addr.get()
            );
            output.write_all(block.as_bytes())?;
        }
        Ok(blocks.len())
    }
}

/// Random access reads over decoded blocks by target address.
#[derive(Debug, Clone)]
pub struct BlocksReader {
    blocks: Vec<Uf2Block>,
    addrs: Range<u64>,
}

impl BlocksReader {
    pub fn new(blocks: Vec<Uf2Block>) -> Result<Self, Uf2Error> {
        let mut start = u64::MAX;
        let mut end = 0;
        for block in &blocks {
            block.validate()?;
            let range = block.address_range();
            start = start.min(range.start);
            end = end.max(range.end);
        }
        if blocks.is_empty() {
            return Err(Uf2Error::NoBlocks);
        }

        Ok(Self {
            blocks,
            addrs: start..end,
        })
    }

    pub fn blocks(&self) -> &[Uf2Block] {
        &self.blocks
    }

    /// Lowest target address to one past the highest payload byte.
    pub fn addrs(&self) -> Range<u64> {
        self.addrs.clone()
    }

    /// Fills `buf` with the block payloads at `addr`; gaps read as zero.
    ///
    /// Returns the index one past the last byte copied from a block.
    pub fn read_at(&self, buf: &mut [u8], addr: u64) -> Result<usize, Uf2Error> {
        let end = addr + buf.len() as u64;
        if !(addr < self.addrs.end && end > self.addrs.start) {
            return Err(Uf2Error::OutOfBounds { addr, end });
        }

        buf.fill(0);
        let mut max_read = 0;
        for block in &self.blocks {
            let range = block.address_range();
            if !(addr < range.end && end > range.start) {
                continue;
            }

            let data = block.data()?;
            let data_offset: usize = addr.saturating_sub(range.start).assert_into();
            let buf_offset: usize = range.start.saturating_sub(addr).assert_into();
            let data = &data[data_offset..];
            let len = min(data.len(), buf.len() - buf_offset);

            buf[buf_offset..buf_offset + len].copy_from_slice(&data[..len]);
            max_read = max_read.max(buf_offset + len);
        }

        Ok(max_read)
    }
}
