//! blockdb - maintenance tool for block stores

use anyhow::{bail, Context, Result};
use blockdb::{RecordManager, StoreConfig};
use clap::{Parser as ClapParser, Subcommand};
use std::path::{Path, PathBuf};

/// blockdb - inspect and maintain a block store
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Skip fsync on commit
    #[arg(long, global = true)]
    no_sync: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty store
    Create {
        path: PathBuf,

        /// Block size in bytes (power of two, 4096..=65536)
        #[arg(short, long, default_value = "8192")]
        block_size: usize,

        /// Split the store into files of at most this many blocks
        #[arg(long)]
        max_file_blocks: Option<u64>,
    },
    /// Print page and record counts
    Info { path: PathBuf },
    /// Verify the structure of a store
    Check { path: PathBuf },
    /// Replay or discard a leftover transaction log
    Recover { path: PathBuf },
    /// Rewrite a store compactly, keeping every record id
    Defrag { path: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = StoreConfig::default().sync_on_commit(!args.no_sync);
    match args.command {
        Command::Create {
            path,
            block_size,
            max_file_blocks,
        } => {
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            let config = config
                .block_size(block_size)
                .max_file_blocks(max_file_blocks);
            let rm = RecordManager::create(&path, config)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            rm.close()?;
            println!("Created {} with {} byte blocks", path.display(), block_size);
        }
        Command::Info { path } => {
            let rm = open(&path, config)?;
            println!("{}", path.display());
            println!("{}", rm.stats()?);
            rm.close()?;
        }
        Command::Check { path } => {
            let rm = open(&path, config)?;
            let report = rm.verify()?;
            rm.close()?;
            println!(
                "Checked {} pages and {} records",
                report.pages_checked, report.records_checked
            );
            if !report.is_ok() {
                for problem in &report.problems {
                    println!("  {}", problem);
                }
                bail!("{} problems found in {}", report.problems.len(), path.display());
            }
            println!("No problems found");
        }
        Command::Recover { path } => {
            // Opening replays a committed log and discards a torn one
            let rm = open(&path, config)?;
            rm.close()?;
            println!("{} is consistent", path.display());
        }
        Command::Defrag { path } => {
            let rm = open(&path, config)?;
            let summary = rm.defrag().context("Defragmentation failed")?;
            rm.close()?;
            println!(
                "Copied {} records: {} blocks -> {} blocks",
                summary.records, summary.blocks_before, summary.blocks_after
            );
        }
    }

    Ok(())
}

fn open(path: &Path, config: StoreConfig) -> Result<RecordManager> {
    if !path.exists() {
        bail!("{} does not exist", path.display());
    }
    RecordManager::open(path, config).with_context(|| format!("Failed to open {}", path.display()))
}
