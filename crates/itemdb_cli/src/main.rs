//! itemdb CLI
//!
//! Command-line tools for looking into an itemdb store directory.
//!
//! # Commands
//!
//! - `inspect` - Display store statistics and the attribute catalog
//! - `items` - List the live items of one type
//! - `journal` - Dump journal records for debugging
//! - `verify` - Replay the journal and check its integrity

mod commands;

use clap::{ArgAction, Parser, Subcommand};
use commands::OutputFormat;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// itemdb command-line store tools.
#[derive(Parser)]
#[command(name = "itemdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log output (-v info, -vv debug, -vvv trace)
    #[arg(global = true, short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store statistics and the attribute catalog
    Inspect {
        /// Path to the store directory
        dir: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List the live items of one type with their values
    Items {
        /// Path to the store directory
        dir: PathBuf,

        /// Id of the item type, e.g. `tracker:type:issue`
        #[arg(short = 't', long = "type")]
        item_type: String,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Dump journal records without opening the store
    Journal {
        /// Path to the store directory
        dir: PathBuf,

        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Replay the journal and check checksums and change numbers
    Verify {
        /// Path to the store directory
        dir: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { dir, format } => commands::inspect::run(&dir, format)?,
        Commands::Items {
            dir,
            item_type,
            format,
        } => commands::items::run(&dir, &item_type, format)?,
        Commands::Journal { dir, limit, format } => commands::journal::run(&dir, limit, format)?,
        Commands::Verify { dir } => commands::verify::run(&dir)?,
    }

    Ok(())
}
