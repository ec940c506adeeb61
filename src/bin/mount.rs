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

//! `modernfs`: mounts a disk image at a mountpoint through FUSE (§6).

#[path = "mount/fuse_adapter.rs"]
mod fuse_adapter;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fuser::MountOption;
use modernfs::fs::Filesystem;

use fuse_adapter::FuseAdapter;

#[derive(Parser)]
#[command(author, version, about = "Mount a modernfs disk image through FUSE")]
struct Cli {
    /// Path to the disk image to mount
    image: PathBuf,

    /// Directory to mount the file system at
    mountpoint: PathBuf,

    /// Mount read-only
    #[arg(short = 'r', long = "read-only")]
    read_only: bool,

    /// Stay in the foreground instead of daemonizing (for debugging)
    #[arg(short = 'f')]
    foreground: bool,

    /// Enable adapter debug tracing
    #[arg(short = 'd')]
    debug: bool,

    /// Run the adapter single-threaded
    #[arg(short = 's')]
    single_threaded: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    // `fuser::mount2` always runs the session on the calling thread, i.e.
    // always in the foreground; there is no daemonizing path to skip, so
    // `-f` only affects how loudly we say so.
    if !cli.foreground {
        log::info!("modernfs has no daemonizing mode; running in the foreground regardless of -f");
    }

    let fs = match Filesystem::mount(&cli.image, cli.read_only) {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("modernfs: failed to mount {}: {e}", cli.image.display());
            return ExitCode::FAILURE;
        }
    };

    let mut options = vec![
        MountOption::FSName("modernfs".to_string()),
        if cli.read_only { MountOption::RO } else { MountOption::RW },
    ];
    if cli.single_threaded {
        // fuser has no separate multi-threaded session API in this version;
        // `mount2` already dispatches one request at a time. The flag is
        // accepted for CLI-contract compatibility and logged for clarity.
        log::debug!("single-threaded adapter requested (default behavior)");
    }

    log::info!(
        "mounting {} at {} ({})",
        cli.image.display(),
        cli.mountpoint.display(),
        if cli.read_only { "read-only" } else { "read-write" }
    );

    match fuser::mount2(FuseAdapter::new(fs), &cli.mountpoint, &options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("modernfs: mount failed: {e}");
            ExitCode::FAILURE
        }
    }
}
