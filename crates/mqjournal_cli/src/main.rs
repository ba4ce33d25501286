//! mqjournal CLI
//!
//! Command-line tools for inspecting and maintaining journal directories.
//!
//! # Commands
//!
//! - `inspect` - Display per-file headers and record counts
//! - `verify` - Replay the journal read-only and report corruption
//! - `dump` - Print journal records for debugging
//! - `compact` - Rewrite live records into fresh files
//! - `perf-blast` - Measure append throughput

mod commands;

use clap::{Parser, Subcommand};
use commands::JournalArgs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// mqjournal command-line tools.
#[derive(Parser)]
#[command(name = "mqjournal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Journal directory
    #[arg(global = true, short, long, default_value = "data/journal")]
    dir: PathBuf,

    /// Journal file name prefix
    #[arg(global = true, long, default_value = "mqj-data")]
    prefix: String,

    /// Journal file extension
    #[arg(global = true, long, default_value = "mqj")]
    extension: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display per-file headers and record counts
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Replay the journal without modifying it
    Verify,

    /// Print journal records
    Dump {
        /// Maximum number of records to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Rewrite live records into fresh files
    Compact {
        /// Only report how much space compaction would reclaim
        #[arg(long)]
        dry_run: bool,
    },

    /// Append records as fast as possible and report throughput
    PerfBlast {
        /// Number of records to append
        #[arg(short, long, default_value = "100000")]
        records: u64,

        /// Payload size in bytes
        #[arg(short, long, default_value = "1024")]
        size: usize,

        /// Wait for the disk every N records (0 never waits)
        #[arg(long, default_value = "0")]
        sync_every: u64,

        /// Delete every record after appending it
        #[arg(long)]
        delete: bool,

        /// I/O backend (ASYNCIO, NIO)
        #[arg(long, default_value = "ASYNCIO")]
        journal_type: String,

        /// Journal file size in bytes
        #[arg(long, default_value = "10485760")]
        file_size: u64,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = JournalArgs {
        dir: cli.dir,
        prefix: cli.prefix,
        extension: cli.extension,
    };

    match cli.command {
        Commands::Inspect { format } => commands::inspect::run(&args, &format)?,
        Commands::Verify => commands::verify::run(&args)?,
        Commands::Dump { limit, format } => commands::dump::run(&args, limit, &format)?,
        Commands::Compact { dry_run } => commands::compact::run(&args, dry_run)?,
        Commands::PerfBlast {
            records,
            size,
            sync_every,
            delete,
            journal_type,
            file_size,
        } => {
            let options = commands::perf_blast::BlastOptions {
                records,
                size,
                sync_every,
                delete,
                journal_type: journal_type.parse()?,
                file_size,
            };
            commands::perf_blast::run(&args, &options)?;
        }
        Commands::Version => {
            println!("mqjournal CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Journal format v{}", mqjournal_core::FORMAT_VERSION);
        }
    }

    Ok(())
}
