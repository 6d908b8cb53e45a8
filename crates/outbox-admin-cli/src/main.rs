//! outboxctl - inspect and repair a SQLite-backed transactional outbox.

mod commands;
mod logging;
mod output;
mod paths;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use outbox_engine::EntryStatus;

use crate::logging::{init_logging, LogFormat};
use crate::output::OutputFormat;
use crate::paths::Paths;

/// Operator tooling for transactional outboxes.
#[derive(Parser, Debug)]
#[command(name = "outboxctl")]
#[command(about = "Inspect, whitelist and purge transactional outbox entries")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database file. Defaults to ~/.outbox/outbox.db
    #[arg(long, env = "OUTBOX_DB", global = true)]
    db: Option<PathBuf>,

    /// Engine configuration file. Defaults to ~/.outbox/config.json
    #[arg(long, env = "OUTBOX_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Log line format on stderr (text or json)
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database if needed and apply pending migrations
    Migrate,

    /// List entries, oldest first
    List {
        /// Only entries in this state
        #[arg(short, long, value_parser = parse_status)]
        status: Option<EntryStatus>,

        /// Shorthand for --status blacklisted
        #[arg(long, conflicts_with = "status")]
        blacklisted: bool,

        /// Maximum number of entries to show
        #[arg(short, long, default_value_t = outbox_sqlite_persist::DEFAULT_LIST_LIMIT)]
        limit: usize,
    },

    /// Show one entry
    Show {
        /// Entry ID
        id: String,
    },

    /// Count entries per state
    Stats,

    /// Return a blacklisted entry to the pending state
    Whitelist {
        /// Entry ID
        id: String,
    },

    /// Delete processed entries whose retention has ended
    Purge {
        /// Delete every processed entry, even within retention
        #[arg(long)]
        all: bool,
    },

    /// Print the effective engine configuration
    ShowConfig,
}

fn parse_status(raw: &str) -> Result<EntryStatus, String> {
    match raw.to_ascii_lowercase().as_str() {
        "pending" => Ok(EntryStatus::Pending),
        "blacklisted" => Ok(EntryStatus::Blacklisted),
        "processed" => Ok(EntryStatus::Processed),
        other => Err(format!(
            "unknown status '{other}' (expected pending, blacklisted or processed)"
        )),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.log_format);

    let paths = Paths::resolve(cli.db, cli.config)?;
    let format = cli.format;

    match cli.command {
        Commands::Migrate => commands::migrate(&paths, &format).await?,
        Commands::List {
            status,
            blacklisted,
            limit,
        } => {
            let status = if blacklisted {
                Some(EntryStatus::Blacklisted)
            } else {
                status
            };
            commands::list(&paths, status, limit, &format).await?
        }
        Commands::Show { id } => commands::show(&paths, &id, &format).await?,
        Commands::Stats => commands::stats(&paths, &format).await?,
        Commands::Whitelist { id } => commands::whitelist(&paths, &id, &format).await?,
        Commands::Purge { all } => commands::purge(&paths, all, &format).await?,
        Commands::ShowConfig => commands::show_config(&paths, &format)?,
    }

    Ok(())
}
