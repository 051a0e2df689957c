//! CLI Tests
//!
//! Report and config files on disk through to the rebuilt failover unit,
//! and the error codes a caller sees when they are wrong.

use std::fs;
use std::io::Write;

use fabric_ra::cli::{load_config, read_reports, rebuild_from_reports, CliErrorCode};
use fabric_ra::fm::{NodeReport, DEFAULT_PRIMARY_EPOCH_INCREMENT};
use fabric_ra::observability::MetricsRegistry;
use fabric_ra::reliability::{
    Epoch, FailoverUnitDescription, FailoverUnitInfo, NodeInstance, ReplicaDescription,
    ReplicaInfo, ReplicaRole, ServiceDescription,
};
use tempfile::{NamedTempFile, TempDir};
use uuid::Uuid;

// =============================================================================
// Fixture
// =============================================================================

fn report(
    failover_unit_id: Uuid,
    source: u64,
    primary: u64,
    nodes: &[u64],
) -> NodeReport {
    let replicas = nodes
        .iter()
        .map(|&node| {
            let role = if node == primary {
                ReplicaRole::Primary
            } else {
                ReplicaRole::Secondary
            };
            let description =
                ReplicaDescription::new(NodeInstance::new(node, 1), node as i64, 1)
                    .with_roles(ReplicaRole::None, role);
            ReplicaInfo::new(description, ReplicaRole::None)
        })
        .collect();

    NodeReport {
        source: NodeInstance::new(source, 1),
        info: FailoverUnitInfo {
            service: ServiceDescription::stateful("fabric:/TestApp", 3, 2, true),
            failover_unit: FailoverUnitDescription::new(failover_unit_id)
                .with_epochs(Epoch::from_parts(0, 0, 0), Epoch::from_parts(1, 2, 2)),
            intermediate_configuration_epoch: Epoch::from_parts(0, 0, 0),
            is_report_from_primary: source == primary,
            replicas,
        },
    }
}

fn write_reports(reports: &[NodeReport]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    for report in reports {
        writeln!(file, "{}", serde_json::to_string(report).unwrap()).unwrap();
        writeln!(file).unwrap();
    }
    file.flush().unwrap();
    file
}

// =============================================================================
// Reports
// =============================================================================

/// Reports written one per line read back unchanged; blank lines are
/// skipped.
#[test]
fn test_read_reports_from_file() {
    let id = Uuid::new_v4();
    let reports = vec![report(id, 1, 1, &[1, 2]), report(id, 2, 1, &[1, 2])];
    let file = write_reports(&reports);

    let read = read_reports(file.path()).unwrap();
    assert_eq!(read, reports);
}

/// A malformed line names its line number.
#[test]
fn test_malformed_report_line() {
    let id = Uuid::new_v4();
    let mut file = write_reports(&[report(id, 1, 1, &[1])]);
    writeln!(file, "{{\"source\": 3").unwrap();
    file.flush().unwrap();

    let err = read_reports(file.path()).unwrap_err();
    assert_eq!(err.code(), &CliErrorCode::InvalidReport);
    assert!(err.message().contains("line 3"));
}

#[test]
fn test_missing_report_file() {
    let dir = TempDir::new().unwrap();
    let err = read_reports(&dir.path().join("absent.jsonl")).unwrap_err();
    assert_eq!(err.code(), &CliErrorCode::IoError);
}

// =============================================================================
// Rebuild
// =============================================================================

/// A primary report alone keeps its configuration.
#[test]
fn test_rebuild_from_primary_report() {
    let id = Uuid::new_v4();
    let file = write_reports(&[report(id, 1, 1, &[1])]);
    let metrics = MetricsRegistry::new();

    let reports = read_reports(file.path()).unwrap();
    let unit = rebuild_from_reports(reports, DEFAULT_PRIMARY_EPOCH_INCREMENT, false, &metrics)
        .unwrap()
        .expect("unit generated");

    assert_eq!(unit.failover_unit_id, id);
    assert_eq!(unit.current_configuration_epoch, Epoch::from_parts(1, 2, 2));
    assert_eq!(unit.primary().map(|r| r.node_id()), Some(1));
    assert!(unit.is_below_min_replica_set_size());
    assert_eq!(metrics.snapshot().rebuilds_generated, 1);
}

#[test]
fn test_rebuild_empty_reports() {
    let metrics = MetricsRegistry::new();
    let err = rebuild_from_reports(Vec::new(), DEFAULT_PRIMARY_EPOCH_INCREMENT, false, &metrics)
        .unwrap_err();
    assert_eq!(err.code(), &CliErrorCode::InvalidReport);
}

/// Two primaries at the same epoch cannot be rebuilt.
#[test]
fn test_rebuild_ambiguous_primary() {
    let id = Uuid::new_v4();
    let reports = vec![report(id, 1, 1, &[1, 2]), report(id, 2, 2, &[1, 2])];
    let metrics = MetricsRegistry::new();

    let err = rebuild_from_reports(reports, DEFAULT_PRIMARY_EPOCH_INCREMENT, false, &metrics)
        .unwrap_err();
    assert_eq!(err.code(), &CliErrorCode::RebuildFailed);
    assert_eq!(err.code_str(), "FABRIC_CLI_REBUILD_FAILED");
}

/// One run rebuilds one partition.
#[test]
fn test_rebuild_rejects_mixed_partitions() {
    let reports = vec![
        report(Uuid::new_v4(), 1, 1, &[1]),
        report(Uuid::new_v4(), 2, 2, &[2]),
    ];
    let metrics = MetricsRegistry::new();

    let err = rebuild_from_reports(reports, DEFAULT_PRIMARY_EPOCH_INCREMENT, false, &metrics)
        .unwrap_err();
    assert_eq!(err.code(), &CliErrorCode::InvalidReport);
}

// =============================================================================
// Config
// =============================================================================

/// An empty object takes every default.
#[test]
fn test_load_default_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fabric-ra.json");
    fs::write(&path, "{}").unwrap();

    let config = load_config(&path).unwrap();
    assert_eq!(config, fabric_ra::ra::FailoverConfig::default());
}

#[test]
fn test_load_config_overrides() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fabric-ra.json");
    fs::write(
        &path,
        r#"{"min_get_lsn_wait_duration_ms": 2000, "rebuild_primary_epoch_increment": 1}"#,
    )
    .unwrap();

    let config = load_config(&path).unwrap();
    assert_eq!(config.min_get_lsn_wait_duration_ms, 2000);
    assert_eq!(config.rebuild_primary_epoch_increment, 1);
}

#[test]
fn test_invalid_config_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fabric-ra.json");

    fs::write(&path, r#"{"reconfiguration_message_retry_interval_ms": 0}"#).unwrap();
    let err = load_config(&path).unwrap_err();
    assert_eq!(err.code(), &CliErrorCode::ConfigError);

    fs::write(&path, "not json").unwrap();
    let err = load_config(&path).unwrap_err();
    assert_eq!(err.code(), &CliErrorCode::ConfigError);

    let err = load_config(&dir.path().join("absent.json")).unwrap_err();
    assert_eq!(err.code(), &CliErrorCode::ConfigError);
}
