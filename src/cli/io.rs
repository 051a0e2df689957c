//! File and stdout handling for the CLI
//!
//! - Reports: one JSON `NodeReport` per line, blank lines skipped
//! - Config: a single JSON `FailoverConfig` object
//! - Output: one JSON object on stdout

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use serde_json::Value;

use crate::fm::NodeReport;
use crate::ra::FailoverConfig;

use super::errors::{CliError, CliResult};

/// Read node reports, one per line.
pub fn read_reports(path: &Path) -> CliResult<Vec<NodeReport>> {
    let file = fs::File::open(path).map_err(|e| {
        CliError::io_error(format!("cannot open reports {}: {}", path.display(), e))
    })?;

    let mut reports = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let report: NodeReport = serde_json::from_str(&line).map_err(|e| {
            CliError::invalid_report(format!("line {}: {}", index + 1, e))
        })?;
        reports.push(report);
    }
    Ok(reports)
}

/// Load and validate a failover configuration.
pub fn load_config(path: &Path) -> CliResult<FailoverConfig> {
    let content = fs::read_to_string(path).map_err(|e| {
        CliError::config_error(format!("cannot read config {}: {}", path.display(), e))
    })?;
    let config: FailoverConfig = serde_json::from_str(&content)
        .map_err(|e| CliError::config_error(format!("invalid config: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Write a success response to stdout
pub fn write_response(data: Value) -> CliResult<()> {
    let response = serde_json::json!({
        "status": "ok",
        "data": data
    });

    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, &response)?;
    writeln!(stdout)?;
    stdout.flush()?;

    Ok(())
}
