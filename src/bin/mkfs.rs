/*
 * This file is part of ModernFS.
 *
 * ModernFS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * ModernFS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * ModernFS. If not, see <https://www.gnu.org/licenses/>.
 */

//! `mkfs.modernfs`: formats a disk image file with a fresh superblock,
//! journal, bitmaps, inode table, and root directory (§6).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use modernfs::format::{self, MAX_SIZE_MIB, MIN_SIZE_MIB};

#[derive(Parser)]
#[command(author, version, about = "Format a disk image for modernfs")]
struct Cli {
    /// Path to the disk image to create or overwrite
    image: PathBuf,

    /// Image size in MiB
    size_mib: u64,

    /// Increase log verbosity
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if !(MIN_SIZE_MIB..=MAX_SIZE_MIB).contains(&cli.size_mib) {
        eprintln!(
            "mkfs.modernfs: size must be between {MIN_SIZE_MIB} and {MAX_SIZE_MIB} MiB, got {}",
            cli.size_mib
        );
        return ExitCode::FAILURE;
    }

    match format::format_image(&cli.image, cli.size_mib) {
        Ok(()) => {
            log::info!(
                "formatted {} ({} MiB)",
                cli.image.display(),
                cli.size_mib
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("mkfs.modernfs: {e}");
            ExitCode::FAILURE
        }
    }
}
