//! nestfs: read and write entries of (nested) ZIP archives.
//!
//! # Usage
//!
//! ```bash
//! # Print an entry, even one inside a nested archive
//! nestfs cat 'data.zip!/lib.zip!/readme.txt'
//!
//! # Replace an entry with the content of a file (or stdin)
//! nestfs put 'data.zip!/notes.txt' --from notes.txt
//!
//! # List the entries of an archive
//! nestfs ls data.zip
//! ```

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn};
use nestfs::{Config, NestFs};
use nestfs_core::{Closeable, MountPoint, Severity, Size, Strategy};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;

/// Read and write entries of ZIP archives, including archives nested in archives.
///
/// Entry paths separate archives from their entries with `!/`.
#[derive(Parser, Debug)]
#[command(name = "nestfs")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Number of archives kept mounted at once
    #[arg(long, global = true)]
    max_mounted: Option<usize>,

    /// Relay every write to the archive immediately
    #[arg(long, global = true)]
    write_through: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the content of an entry
    Cat {
        #[arg(value_name = "PATH")]
        path: String,
    },
    /// Replace the content of an entry
    Put {
        #[arg(value_name = "PATH")]
        path: String,

        /// Read the content from this file instead of stdin
        #[arg(long, value_name = "FILE")]
        from: Option<PathBuf>,
    },
    /// List the entries of an archive
    Ls {
        #[arg(value_name = "ARCHIVE")]
        archive: String,
    },
    /// Mount archives and print the manager's bookkeeping as JSON
    Stats {
        #[arg(value_name = "ARCHIVE", required = true)]
        archives: Vec<String>,
    },
}

fn load_config(args: &Args) -> Result<Config, String> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).map_err(|e| format!("{}: {}", path.display(), e))?,
        None => Config::default(),
    };
    config.apply_env().map_err(|e| e.to_string())?;
    if let Some(max_mounted) = args.max_mounted {
        config.max_mounted = max_mounted;
    }
    if args.write_through {
        config.strategy = Strategy::WriteThrough;
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn run(fs: &NestFs, command: Command) -> Result<(), String> {
    match command {
        Command::Cat { path } => {
            let mut input = fs.open_input(&path).map_err(|e| format!("{}: {}", path, e))?;
            let copied = io::copy(&mut input, &mut io::stdout().lock());
            let closed = input.close();
            copied.map_err(|e| format!("{}: {}", path, e))?;
            closed.map_err(|e| format!("{}: {}", path, e))?;
        }
        Command::Put { path, from } => {
            let data = match &from {
                Some(file) => {
                    fs::read(file).map_err(|e| format!("{}: {}", file.display(), e))?
                }
                None => {
                    let mut data = Vec::new();
                    io::stdin()
                        .read_to_end(&mut data)
                        .map_err(|e| format!("failed to read stdin: {}", e))?;
                    data
                }
            };
            fs.write(&path, &data)
                .map_err(|e| format!("{}: {}", path, e))?;
            info!("Wrote {} bytes to {}", data.len(), path);
        }
        Command::Ls { archive } => {
            let mount_point = MountPoint::new(archive);
            let entries = fs
                .entries(&mount_point)
                .map_err(|e| format!("{}: {}", mount_point, e))?;
            for entry in entries {
                match entry.size(Size::Data) {
                    Some(size) => println!("{:>10}  {}", size, entry.name()),
                    None => println!("{:>10}  {}", "-", entry.name()),
                }
            }
        }
        Command::Stats { archives } => {
            for archive in archives {
                let mount_point = MountPoint::new(archive);
                fs.entries(&mount_point)
                    .map_err(|e| format!("{}: {}", mount_point, e))?;
            }
            let json = serde_json::to_string_pretty(&fs.stats())
                .map_err(|e| format!("failed to encode stats: {}", e))?;
            println!("{}", json);
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    let fs = match NestFs::new(config) {
        Ok(fs) => fs,
        Err(e) => {
            error!("Failed to initialize: {}", e);
            process::exit(1);
        }
    };

    let result = run(&fs, args.command);

    // Unmount everything so staged writes reach the archives
    let synced = match fs.umount() {
        Ok(()) => true,
        Err(e) if e.severity() == Severity::Warning => {
            warn!("{}", e);
            true
        }
        Err(e) => {
            error!("Failed to unmount: {}", e);
            false
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
    if !synced {
        process::exit(1);
    }
}
