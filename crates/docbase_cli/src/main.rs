//! docbase CLI
//!
//! Command-line tools for docbase database directories.
//!
//! # Commands
//!
//! - `inspect` - List collections, their parameters and indexes
//! - `figures` - Show per-collection storage figures
//! - `dump-wal` - Dump write-ahead log markers for debugging
//! - `verify` - Check log integrity and replay every collection

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// docbase command-line database tools.
#[derive(Parser)]
#[command(name = "docbase")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Print JSON instead of text
    #[arg(global = true, long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List collections, their parameters and indexes
    Inspect {
        /// Only this collection
        #[arg(short, long)]
        collection: Option<String>,
    },

    /// Show per-collection storage figures
    Figures {
        /// Only this collection
        #[arg(short, long)]
        collection: Option<String>,
    },

    /// Dump write-ahead log markers
    DumpWal {
        /// Maximum number of markers to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Start from this byte offset
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Only markers of this collection id
        #[arg(long)]
        cid: Option<u64>,
    },

    /// Check log integrity and replay every collection
    Verify,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { collection } => {
            let path = cli.path.ok_or("Database path required for inspect")?;
            commands::inspect::run(&path, collection.as_deref(), cli.json)?;
        }
        Commands::Figures { collection } => {
            let path = cli.path.ok_or("Database path required for figures")?;
            commands::figures::run(&path, collection.as_deref(), cli.json)?;
        }
        Commands::DumpWal { limit, offset, cid } => {
            let path = cli.path.ok_or("Database path required for dump-wal")?;
            commands::dump_wal::run(&path, limit, offset, cid, cli.json)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Database path required for verify")?;
            let report = commands::verify::run(&path, cli.json)?;
            if !report.is_ok() {
                std::process::exit(1);
            }
        }
        Commands::Version => {
            println!("docbase CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("docbase core v{}", docbase_core::VERSION);
        }
    }

    Ok(())
}
