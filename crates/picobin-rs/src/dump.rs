use std::{cmp::min, fmt, fs::File, io::BufReader, path::Path};

use picobin_core::{chain::ChainBlock, elf_rom, open_elf, ItemType};

use crate::Flags;

/// Hex dumps the data between each block and the one it links to.
///
/// Blocks starting with an ignored item are skipped, and the dump stops at the first block
/// linking backwards.
pub fn elfdump<P: AsRef<Path>>(
    input_path: &P,
    flags: &Flags,
) -> Result<(), Box<dyn std::error::Error>> {
    let input = BufReader::new(File::open(input_path.as_ref())?);
    let mut elf = open_elf(input, &flags.options)?;
    let rom = elf_rom(&mut elf, &flags.options)?;

    for (i, chain_block) in rom.walk()?.enumerate() {
        let ChainBlock { offset, block } = chain_block?;
        let ignored = block
            .items
            .first()
            .is_some_and(|item| item.item_type == ItemType::Ignored);
        if !flags.selects(i) || ignored {
            continue;
        }

        let data_size = block.link - block.size() as i64;
        if data_size < 0 {
            // Last block.
            break;
        }
        let start = offset + block.size();
        let end = min(start + data_size as usize, rom.data.len());
        let data = rom
            .data
            .get(start..end)
            .filter(|data| !data.is_empty())
            .ok_or("unable to extract data after block")?;

        print!(
            "BLOCK{} @ Addr={:#x} dump:\n{}",
            i,
            rom.address_of(offset),
            HexDump(data)
        );
    }

    Ok(())
}

/// Canonical hex+ASCII listing, 16 bytes per line.
pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (line, chunk) in self.0.chunks(16).enumerate() {
            write!(f, "{:08x}  ", line * 16)?;
            for i in 0..16 {
                match chunk.get(i) {
                    Some(byte) => write!(f, "{:02x} ", byte)?,
                    None => f.write_str("   ")?,
                }
                if i == 7 {
                    f.write_str(" ")?;
                }
            }

            f.write_str(" |")?;
            for &byte in chunk {
                let c = if (0x20..0x7f).contains(&byte) {
                    byte as char
                } else {
                    '.'
                };
                write!(f, "{}", c)?;
            }
            f.write_str("|\n")?;
        }
        Ok(())
    }
}
