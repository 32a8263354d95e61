use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::*;
use picobin_core::{parse_family_id, Family, RomOptions, DEFAULT_READ_LIMIT};

use std::io::Write;

use crate::{
    convert::uf2conv,
    dump::elfdump,
    info::{elfinfo, uf2info},
};

mod convert;
mod dump;
mod info;
mod reporter;

#[derive(Parser, Debug)]
enum Command {
    /// Print ROM sections and picobin blocks of an ELF file
    #[command(name = "elfinfo", arg_required_else_help = true)]
    Elfinfo {
        /// Input ELF file
        input: String,
    },
    /// Hex dump the data following each block of an ELF file
    #[command(name = "elfdump", arg_required_else_help = true)]
    Elfdump {
        /// Input ELF file
        input: String,
    },
    /// Print UF2 blocks and the picobin blocks they contain
    #[command(name = "uf2info", arg_required_else_help = true)]
    Uf2info {
        /// Input UF2 file
        input: String,
    },
    /// Convert the ROM of an ELF file to a UF2 file next to it
    #[command(name = "uf2conv", arg_required_else_help = true)]
    Uf2conv {
        /// Input ELF file
        input: String,
    },
}

fn address_parser(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|err| format!("Invalid address '{}': {}", s, err))
}

fn family_parser(s: &str) -> Result<u32, String> {
    parse_family_id(s).map_err(|err| {
        let names: Vec<&str> = Family::ALL.iter().map(|family| family.name()).collect();
        format!("{}, expected one of {} or a numeric id", err, names.join(", "))
    })
}

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None, author = "Jonathan Nilsson")]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Set the logging verbosity
    #[clap(short, long, value_enum, global = true, default_value_t = LogLevel::Info)]
    verbose: LogLevel,

    /// Only report the block with this index
    #[clap(long, global = true)]
    block: Option<usize>,

    /// Size of the image searched for blocks, starting at the ROM start address
    #[clap(long, global = true, default_value_t = DEFAULT_READ_LIMIT)]
    readlim: u64,

    /// ELF data at or above this address is not ROM
    #[clap(long, global = true, value_parser = address_parser, default_value = "0x20000000")]
    flashend: u64,

    /// UF2 family, by name or numeric id
    #[clap(long, global = true, value_parser = family_parser, default_value = "rp2350-arm-s")]
    family: u32,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Off => LevelFilter::Off,
        }
    }
}

/// Settings shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Flags {
    pub block: Option<usize>,
    pub options: RomOptions,
    pub family_id: u32,
}

impl Flags {
    /// Whether block `index` is part of the report.
    pub fn selects(&self, index: usize) -> bool {
        self.block.map_or(true, |block| block == index)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default())
        .filter_level(cli.verbose.into())
        .target(env_logger::Target::Stdout)
        .format(|buf, record| {
            let level = record.level();
            if level == Level::Info {
                writeln!(buf, "{}", record.args())
            } else {
                writeln!(buf, "{}: {}", record.level(), record.args())
            }
        })
        .init();

    let command = match cli.command {
        Some(command) => command,
        None => return Ok(()),
    };

    let flags = Flags {
        block: cli.block,
        options: RomOptions {
            flash_end: cli.flashend,
            read_limit: cli.readlim,
        },
        family_id: cli.family,
    };
    debug!("{:?}", flags);

    match command {
        Command::Elfinfo { input } => elfinfo(&input, &flags),
        Command::Elfdump { input } => elfdump(&input, &flags),
        Command::Uf2info { input } => uf2info(&input, &flags),
        Command::Uf2conv { input } => uf2conv(&input, &flags),
    }
}
