//! `zippy`: a small command-line front end over the [`zippy`] library.
//!
//! `zippy [OPTIONS] ZIPFILE [ENTRY]`
//!
//! - `-a` extract every entry to stdout, one after another.
//! - `-t` list entry names to stdout (`-a` and `-t` are mutually exclusive).
//! - `-r ENTRY` remove an entry.
//! - `-d` compact the archive, reclaiming space left by replaced/removed entries.
//! - With no options and an `ENTRY`, extract that one entry to stdout.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use log::error;

use zippy::{OpenMode, ZipArchive};

#[derive(Parser)]
#[command(name = "zippy", about = "Random-access ZIP32 archive inspector")]
struct Cli {
    /// Extract every entry to stdout.
    #[arg(short = 'a', conflicts_with = "list")]
    extract_all: bool,

    /// List entry names to stdout.
    #[arg(short = 't')]
    list: bool,

    /// Remove this entry from the archive.
    #[arg(short = 'r', value_name = "ENTRY")]
    remove: Option<String>,

    /// Compact the archive, eliminating gaps left by replaced/removed entries.
    #[arg(short = 'd')]
    compact: bool,

    /// The archive to operate on.
    zipfile: String,

    /// An entry to extract, when no other mode flag is given.
    entry: Option<String>,
}

fn run(cli: Cli) -> zippy::Result<bool> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cli.zipfile)
        .map_err(zippy::Error::from)?;
    let mut archive = ZipArchive::open(file)?;
    let mut ok = true;

    if cli.list {
        for name in archive.entries() {
            println!("{name}");
        }
    } else if cli.extract_all {
        let names: Vec<String> = archive.entries().map(str::to_string).collect();
        for name in names {
            if let Err(e) = extract_one(&mut archive, &name, &mut io::stdout()) {
                error!("extracting {name:?}: {e}");
                ok = false;
            }
        }
    } else if let Some(name) = &cli.remove {
        if !archive.remove(name)? {
            error!("no such entry: {name:?}");
            ok = false;
        }
    } else if let Some(name) = &cli.entry {
        extract_one(&mut archive, name, &mut io::stdout())?;
    }

    if cli.compact {
        archive.compact()?;
    } else {
        archive.close()?;
    }

    Ok(ok)
}

fn extract_one<T: Read + Write + io::Seek>(
    archive: &mut ZipArchive<T>,
    name: &str,
    out: &mut impl Write,
) -> zippy::Result<()> {
    let mut entry = match archive.entry(name, OpenMode::Read)? {
        Some(entry) => entry,
        None => {
            return Err(zippy::Error::BadConfig("entry not found"));
        }
    };
    io::copy(&mut entry, out).map_err(zippy::Error::from)?;
    entry.close()
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    // `Parser::parse()` prints clap's usage message and exits with its own
    // default code (2) on a bad argument, bypassing the 0/1 exit contract
    // this CLI promises; `try_parse()` lets us map that failure to exit 1
    // ourselves. `--help`/`--version` still exit 0, matching clap's own
    // convention for those two non-error cases.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
