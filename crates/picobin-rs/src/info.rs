use std::{fs::File, io::BufReader, path::Path};

use log::{info, warn};
use picobin_core::{
    chain::{ChainBlock, ChainError},
    elf_rom, open_elf,
    uf2::{decode_blocks, BlocksReader},
    uf2_rom, Rom,
};
use sha2::{Digest, Sha256};

use crate::Flags;

/// Prints every block of the chain in `rom`, then the blocks that fail validation.
pub fn print_blocks(rom: &Rom, flags: &Flags) -> Result<(), Box<dyn std::error::Error>> {
    let mut blocks = Vec::new();
    let mut failure = None;
    for block in rom.walk()? {
        match block {
            Ok(block) => blocks.push(block),
            Err(err) => failure = Some(err),
        }
    }

    for (i, ChainBlock { offset, block }) in blocks.iter().enumerate() {
        if !flags.selects(i) {
            continue;
        }
        println!(
            "BLOCK{} @ Addr={:#x} Size={} Items={}",
            i,
            rom.address_of(*offset),
            block.size(),
            block.items.len()
        );
        for item in &block.items {
            println!("\t{}", item);
        }
    }

    for (i, chain_block) in blocks.iter().enumerate() {
        if let Err(err) = chain_block.block.validate() {
            println!("BLOCK{} failed to validate: {}", i, err);
        }
    }

    match failure {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

pub fn elfinfo<P: AsRef<Path>>(
    input_path: &P,
    flags: &Flags,
) -> Result<(), Box<dyn std::error::Error>> {
    let input = BufReader::new(File::open(input_path.as_ref())?);
    let mut elf = open_elf(input, &flags.options)?;

    println!("ELF info:");
    let mut total_size = 0;
    for section in elf.rom_sections()? {
        println!(
            "\t{} Addr={:#x} Size={}",
            section.name, section.addr, section.size
        );
        total_size += section.size;
    }
    println!("total program memory={}", total_size);

    let rom = elf_rom(&mut elf, &flags.options)?;
    print_blocks(&rom, flags)
}

pub fn uf2info<P: AsRef<Path>>(
    input_path: &P,
    flags: &Flags,
) -> Result<(), Box<dyn std::error::Error>> {
    let input = BufReader::new(File::open(input_path.as_ref())?);
    let blocks = decode_blocks(input)?;

    println!("UF2 {} blocks:", blocks.len());
    for block in &blocks {
        match block.data() {
            Ok(data) => println!("\t{} sha256={}", block, sha256_hex(data)),
            Err(err) => println!("\tblock{}: {}", block.block_no.get(), err),
        }
    }

    if blocks.is_empty() {
        warn!("No UF2 blocks in {}", input_path.as_ref().display());
        return Ok(());
    }

    let reader = BlocksReader::new(blocks)?;
    let rom = uf2_rom(&reader, flags.options.read_limit)?;
    match rom.first_block() {
        Ok(_) => print_blocks(&rom, flags),
        Err(ChainError::NoStartMarker) => {
            info!("No picobin blocks found");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_hex(&[]).len(), 64);
    }
}
