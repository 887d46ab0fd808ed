//! TableSync CLI
//!
//! Command-line tools for TableSync stores.
//!
//! # Commands
//!
//! - `inspect` - Display tables, columns, indexes and guard triggers
//! - `dump-log` - Dump replication log records in timestamp order
//! - `verify` - Check the replication log for gaps and bad records
//! - `replay` - Replay pending replication records

mod commands;
mod error;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tablesync_replication::NodeId;
use tracing_subscriber::EnvFilter;

/// TableSync command-line store tools.
#[derive(Parser)]
#[command(name = "tablesync")]
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
    /// Display tables, columns, indexes and guard triggers
    Inspect {
        /// Only this table
        #[arg(short, long)]
        table: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump replication log records in timestamp order
    DumpLog {
        /// Start after this timestamp, in milliseconds
        #[arg(short, long, default_value = "0")]
        after: u64,

        /// Include records stamped exactly at `after`
        #[arg(short, long)]
        inclusive: bool,

        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check the replication log for gaps and bad records
    Verify {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Replay pending replication records
    Replay {
        /// Node id to open the log as
        #[arg(short, long)]
        node: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
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
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { table, format } => {
            let path = cli.path.ok_or("Database path required for inspect")?;
            commands::inspect::run(&path, table.as_deref(), &format)?;
        }
        Commands::DumpLog {
            after,
            inclusive,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Database path required for dump-log")?;
            let options = commands::dump_log::DumpOptions {
                after,
                inclusive,
                limit,
            };
            commands::dump_log::run(&path, &options, &format)?;
        }
        Commands::Verify { format } => {
            let path = cli.path.ok_or("Database path required for verify")?;
            commands::verify::run(&path, &format)?;
        }
        Commands::Replay { node, format } => {
            let path = cli.path.ok_or("Database path required for replay")?;
            let node = node
                .map(|id| id.parse::<NodeId>())
                .transpose()
                .map_err(|e| error::CliError::InvalidArgument(e.to_string()))?;
            commands::replay::run(&path, node, &format)?;
        }
        Commands::Version => {
            println!("TableSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
