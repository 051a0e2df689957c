//! CLI argument definitions using clap
//!
//! Commands:
//! - fabric-ra rebuild --reports <path> [--config <path>] [--ignore-constraints]
//! - fabric-ra check-config --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Reconfiguration agent and failover manager rebuild tools
#[derive(Parser, Debug)]
#[command(name = "fabric-ra")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Rebuild one partition from node reports and print the result
    Rebuild {
        /// File with one JSON node report per line
        #[arg(long)]
        reports: PathBuf,

        /// Failover configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Generate even when two nodes left the same PC for different CCs
        #[arg(long)]
        ignore_constraints: bool,
    },

    /// Load and validate a failover configuration file
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./fabric-ra.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
