use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "certsync")]
#[command(about = "Inspect and drain the offline certificate sync queue")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the local store file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show local certificates and their sync state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or repair the pending-operation queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Push every dirty certificate to the server once
    Drain {
        /// Output the drain report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep draining whenever the server becomes reachable (Ctrl-C to stop)
    Watch {
        /// Seconds between reachability probes
        #[arg(long, default_value = "15", value_name = "SECS")]
        probe_interval: u64,
    },
    /// Delete a certificate, its queued operations and attachments locally
    Discard {
        /// Certificate ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// List queued operations in drain order
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List operations the drain has stopped retrying
    DeadLetters {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Put a dead-lettered operation back in line
    Retry {
        /// Queue sequence number
        seq: i64,
    },
}
