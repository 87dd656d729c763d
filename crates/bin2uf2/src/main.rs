use bin2uf2_core::{ConvertOptions, Family};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::*;

use std::{error::Error, io::Write, path::PathBuf, process::ExitCode};

use crate::{convert::convert, info::info};

mod convert;
mod info;
mod reporter;

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a raw binary image to a UF2 file on disk
    #[command(arg_required_else_help = true)]
    Convert {
        /// Input binary file
        input: String,

        /// Output UF2 file, defaults to the input with a .uf2 extension
        output: Option<String>,

        /// Address the first byte of the image is flashed to
        #[clap(short = 'a', long, value_parser = parse_u32, default_value = "0x10000000")]
        base_address: u32,

        /// Family id, either a number or a family name (rp2040, rp2350-riscv, etc.)
        #[clap(short, long, value_parser = family_id_parser, default_value = "rp2040")]
        family_id: u32,
    },
    /// Check a UF2 file and print a summary of it
    #[command(arg_required_else_help = true)]
    Info {
        /// Input UF2 file
        input: String,
    },
}

/// Parses decimal or 0x prefixed hexadecimal, allowing `_` separators.
fn parse_u32(s: &str) -> Result<u32, String> {
    let digits = s.replace('_', "");
    let parsed = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => digits.parse(),
    };
    parsed.map_err(|err| format!("'{}' is not a valid 32 bit number: {}", s, err))
}

fn family_id_parser(s: &str) -> Result<u32, String> {
    if let Some(family) = Family::from_name(s) {
        return Ok(family.id());
    }

    parse_u32(s).map_err(|_| {
        let names: Vec<_> = Family::ALL.iter().map(|family| family.name()).collect();
        format!(
            "Unknown family '{}', expected a number or one of: {}",
            s,
            names.join(", ")
        )
    })
}

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None, author)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Set the logging verbosity
    #[clap(short, long, value_enum, global = true, default_value_t = LogLevel::Info)]
    verbose: LogLevel,

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

/// The message of `err` followed by each of its sources.
fn error_chain(err: &dyn Error) -> Vec<String> {
    let mut chain = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(format!("  caused by: {}", cause));
        source = cause.source();
    }
    chain
}

fn main() -> ExitCode {
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
        None => return ExitCode::SUCCESS,
    };

    let result = match command {
        Command::Convert {
            input,
            output,
            base_address,
            family_id,
        } => {
            let output = match output {
                Some(output) => PathBuf::from(output),
                None => PathBuf::from(&input).with_extension("uf2"),
            };
            let options = ConvertOptions {
                base_address,
                family_id,
            };

            convert(&input, &output, &options)
        }
        Command::Info { input } => info(&input),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            for line in error_chain(&*err) {
                error!("{}", line);
            }
            ExitCode::FAILURE
        }
    }
}
