//! CLI command implementations
//!
//! Each command reads its inputs, runs one library operation and writes a
//! single JSON response to stdout.

use std::path::Path;

use serde_json::{json, Value};

use crate::fm::{FailoverUnit, InBuildFailoverUnit, NodeCache, NodeReport};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};
use crate::ra::FailoverConfig;

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{load_config, read_reports, write_response};

/// Parse arguments and run the selected command.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command)
}

/// Run a CLI command
pub fn run_command(command: Command) -> CliResult<()> {
    match command {
        Command::Rebuild {
            reports,
            config,
            ignore_constraints,
        } => rebuild(&reports, config.as_deref(), ignore_constraints),
        Command::CheckConfig { config } => check_config(&config),
    }
}

/// Rebuild one partition from a report file.
pub fn rebuild(reports: &Path, config: Option<&Path>, ignore_constraints: bool) -> CliResult<()> {
    let config = match config {
        Some(path) => load_config(path)?,
        None => FailoverConfig::default(),
    };
    let reports = read_reports(reports)?;

    let metrics = MetricsRegistry::new();
    let generated = rebuild_from_reports(
        reports,
        config.rebuild_primary_epoch_increment,
        ignore_constraints,
        &metrics,
    )?;

    let data = match generated {
        Some(unit) => serde_json::to_value(unit)?,
        None => Value::Null,
    };
    write_response(data)
}

/// Feed reports into an in-build unit and generate the FM view.
///
/// Every report source is taken as up. All reports must belong to the same
/// partition.
pub fn rebuild_from_reports(
    reports: Vec<NodeReport>,
    primary_epoch_increment: i64,
    ignore_constraints: bool,
    metrics: &MetricsRegistry,
) -> CliResult<Option<FailoverUnit>> {
    let Some(first) = reports.first() else {
        return Err(CliError::invalid_report("report file is empty"));
    };

    let mut in_build = InBuildFailoverUnit::from_report(&first.info)
        .with_primary_epoch_increment(primary_epoch_increment);
    let mut nodes = NodeCache::new();

    for report in reports {
        nodes.node_up(report.source);
        in_build.add(report.info, report.source)?;
    }

    let generated = in_build.generate(&nodes, ignore_constraints)?;
    match generated {
        Some(_) => metrics.increment_rebuilds_generated(),
        None => metrics.increment_rebuilds_not_generated(),
    }
    Ok(generated)
}

/// Load and validate a configuration file.
pub fn check_config(path: &Path) -> CliResult<()> {
    let config = load_config(path)?;

    log_event_with_fields(
        Event::ConfigLoaded,
        &[("path", &path.display().to_string())],
    );

    write_response(json!({
        "config": serde_json::to_value(&config)?,
        "valid": true
    }))
}
