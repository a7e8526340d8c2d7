//! SyncDB CLI
//!
//! Command-line tools for SyncDB database files.
//!
//! # Commands
//!
//! - `inspect` - Display the cursor, dirty keys and storage statistics
//! - `get` - Print one entry
//! - `dump` - List raw records for debugging
//! - `compact` - Rewrite the file keeping only live records

mod commands;

use clap::{Parser, Subcommand};
use commands::Format;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// SyncDB command-line database tools.
#[derive(Parser)]
#[command(name = "syncdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the cursor, dirty keys and storage statistics
    Inspect {
        /// Show every entry
        #[arg(short, long)]
        entries: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Print one entry
    Get {
        /// Key to look up
        key: String,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// List raw records for debugging
    Dump {
        /// Only records whose key starts with this prefix
        #[arg(long)]
        prefix: Option<String>,

        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Rewrite the file keeping only live records
    Compact {
        /// Show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let path = || cli.path.clone().ok_or("database path required (--path)");

    match cli.command {
        Commands::Inspect { entries, format } => commands::inspect::run(&path()?, entries, format)?,
        Commands::Get { ref key, format } => {
            commands::get::run(&path()?, key, cli.verbose, format)?;
        }
        Commands::Dump {
            ref prefix,
            limit,
            format,
        } => commands::dump::run(&path()?, prefix.as_deref(), limit, format)?,
        Commands::Compact { dry_run } => commands::compact::run(&path()?, dry_run)?,
        Commands::Version => println!("SyncDB CLI v{}", env!("CARGO_PKG_VERSION")),
    }
    Ok(())
}
