//! Command-line interface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// Self-hosted Terraform/OpenTofu registry and mirror.
#[derive(Debug, Parser)]
#[command(name = "balise", version, about)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true, default_value = "balise.yaml")]
    pub config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands. Running without one serves.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the registry server with its background workers.
    Serve,
    /// Trigger one mirror sync and wait for it to finish.
    Sync {
        /// Mirror configuration id.
        #[arg(long)]
        mirror: Uuid,
        /// Treat the id as a CLI-binary mirror configuration.
        #[arg(long)]
        binary: bool,
    },
}
