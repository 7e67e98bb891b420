//! keel CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};
use keel_common::telemetry::LogFormat;

/// keel - Move Cluster API clusters between management clusters
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format (text or json)
    #[arg(long, global = true, env = "KEEL_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Move cluster objects from one management cluster to another
    Move(commands::move_cluster::MoveArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Move(args) => commands::move_cluster::run(args).await,
        }
    }
}
