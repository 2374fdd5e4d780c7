use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tally-runtime")]
#[command(about = "Tally runtime supervisor - self-hosted budgeting, no external services")]
pub struct Cli {
    /// Data directory (overrides TALLY_DATA_DIR and the ./data default)
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the API and web processes and supervise them (foreground)
    Start {
        /// Do not open a browser once the app is ready
        #[arg(long)]
        no_browser: bool,
    },
    /// Stop a running instance (reads the PID file)
    Stop,
    /// Show whether an instance is running and whether it is healthy
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage the budget database and its backups
    #[command(subcommand)]
    Db(DbCommands),
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Snapshot the database directory to a timestamped backup
    Backup,
    /// List managed backups, newest first
    List,
    /// Replace the database with a backup (the current state is snapshotted first)
    Restore {
        /// Backup directory, as printed by `db list`
        path: PathBuf,
    },
    /// Delete a backup
    Delete {
        /// Backup directory, as printed by `db list`
        path: PathBuf,
    },
    /// Delete the database and start fresh (a safety backup is created first)
    Reset {
        /// Required: confirms the deletion
        #[arg(long)]
        force: bool,
    },
}
