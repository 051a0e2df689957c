//! CLI module for fabric-ra
//!
//! Provides command-line access to:
//! - rebuild: Generate the FM view of a partition from node reports
//! - check-config: Validate a failover configuration file

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{check_config, rebuild, rebuild_from_reports, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{load_config, read_reports, write_response};
