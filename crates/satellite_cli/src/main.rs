//! Satellite CLI
//!
//! Command-line tools for Satellite databases.
//!
//! # Commands
//!
//! - `inspect` - Display replication cursors, migrations and oplog statistics
//! - `dump-oplog` - Dump oplog entries for debugging
//! - `migrate` - Install the system tables and apply SQL migrations
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Satellite command-line database tools.
#[derive(Parser)]
#[command(name = "satellite")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the SQLite database file
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
    /// Display replication state of a database
    Inspect {
        /// Show replicated tables and their foreign keys
        #[arg(short, long)]
        schema: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump oplog entries for debugging
    DumpOplog {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<u64>,

        /// Skip this many entries
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Only entries not yet stamped by a snapshot
        #[arg(long)]
        pending: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Install the system tables and apply SQL migrations
    Migrate {
        /// Directory of `.sql` migration files, applied in file name order
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Show applied and pending migrations without applying
        #[arg(short, long)]
        status: bool,

        /// Dry run - show what would be applied
        #[arg(long)]
        dry_run: bool,
    },

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
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { schema, format } => {
            let path = cli.path.ok_or("Database path required for inspect")?;
            commands::inspect::run(&path, schema, &format)?;
        }
        Commands::DumpOplog {
            limit,
            offset,
            pending,
            format,
        } => {
            let path = cli.path.ok_or("Database path required for dump-oplog")?;
            commands::dump_oplog::run(&path, limit, offset, pending, &format)?;
        }
        Commands::Migrate {
            dir,
            status,
            dry_run,
        } => {
            let path = cli.path.ok_or("Database path required for migrate")?;
            if status {
                commands::migrate::status(&path, dir.as_deref())?;
            } else {
                commands::migrate::run(&path, dir.as_deref(), dry_run)?;
            }
        }
        Commands::Version => {
            println!("Satellite CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Replication protocol v{}", satellite_engine::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
