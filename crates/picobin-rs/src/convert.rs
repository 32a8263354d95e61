use std::{
    fs::{self, File},
    io::BufReader,
    path::Path,
};

use log::{info, LevelFilter};
use picobin_core::{
    elf_flash_image, open_elf,
    uf2::{Uf2Formatter, UF2_BLOCK_SIZE},
    write_uf2, Family,
};

use crate::{reporter::ProgressBarReporter, Flags};

/// Converts the ROM of an ELF file to a UF2 file with the same stem.
pub fn uf2conv<P: AsRef<Path>>(
    input_path: &P,
    flags: &Flags,
) -> Result<(), Box<dyn std::error::Error>> {
    let input = input_path.as_ref();
    let output_path = input.with_extension("uf2");

    let mut elf = open_elf(BufReader::new(File::open(input)?), &flags.options)?;
    let rom = elf_flash_image(&mut elf, &flags.options)?;

    match Family::from_id(flags.family_id) {
        Some(family) => info!("Using UF2 Family {} ({:#010x})", family, flags.family_id),
        None => info!("Using UF2 Family {:#010x}", flags.family_id),
    }

    let output = File::create(&output_path)?;
    let should_print_progress = log::max_level() >= LevelFilter::Info;

    let result = if should_print_progress {
        let blocks = Uf2Formatter::with_family(flags.family_id).block_count(rom.data.len())?;
        let len = blocks as u64 * UF2_BLOCK_SIZE as u64;
        info!("Writing {} to disk", output_path.display());
        let mut reporter = ProgressBarReporter::new(len, output);
        let result = write_uf2(&rom, flags.family_id, &mut reporter);
        reporter.finish();
        result
    } else {
        write_uf2(&rom, flags.family_id, output)
    };

    match result {
        Ok(blocks) => info!(
            "Wrote {} blocks for {:#x}..{:#x}",
            blocks,
            rom.base,
            rom.address_of(rom.data.len())
        ),
        Err(err) => {
            fs::remove_file(output_path)?;
            return Err(Box::new(err));
        }
    }

    Ok(())
}
