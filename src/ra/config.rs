//! Failover configuration
//!
//! Tunables that shape reconfiguration timing, health escalation and the
//! rebuild epoch policy. Loaded from JSON; every field has a default so an
//! empty object is a valid configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::errors::{RaError, RaResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Interval between message resends while a reconfiguration waits (ms).
    #[serde(default = "default_retry_interval")]
    pub reconfiguration_message_retry_interval_ms: u64,

    /// Phase1 keeps waiting for up replicas that have not replied until this
    /// much time has passed in the phase, even if quorum is already met (ms).
    #[serde(default)]
    pub min_get_lsn_wait_duration_ms: u64,

    /// A phase running longer than this is reported as stuck (ms).
    #[serde(default = "default_health_threshold")]
    pub reconfiguration_health_report_threshold_ms: u64,

    /// Use replica deactivation info to filter out stale primary candidates.
    #[serde(default = "default_true")]
    pub is_deactivation_info_enabled: bool,

    /// Skip Phase3 when every replica is in both PC and CC.
    #[serde(default = "default_true")]
    pub skip_phase3_deactivate_when_configuration_unchanged: bool,

    #[serde(default = "default_open_warning")]
    pub replica_open_failure_warning_threshold: u32,

    /// Open failures after which the local replica is dropped.
    #[serde(default = "default_open_max_retry")]
    pub replica_open_failure_max_retry: u32,

    /// Reopen failures after which the local replica is dropped.
    #[serde(default = "default_reopen_max_retry")]
    pub replica_reopen_failure_max_retry: u32,

    #[serde(default = "default_close_warning")]
    pub replica_close_failure_warning_threshold: u32,

    /// Close failures after which the close is escalated to an abort.
    #[serde(default = "default_close_restart")]
    pub replica_close_failure_restart_threshold: u32,

    /// Primary epoch increment applied when rebuild mints a configuration.
    #[serde(default = "default_rebuild_increment")]
    pub rebuild_primary_epoch_increment: i64,
}

fn default_retry_interval() -> u64 {
    5_000
}
fn default_health_threshold() -> u64 {
    300_000
}
fn default_true() -> bool {
    true
}
fn default_open_warning() -> u32 {
    3
}
fn default_open_max_retry() -> u32 {
    10
}
fn default_reopen_max_retry() -> u32 {
    5
}
fn default_close_warning() -> u32 {
    3
}
fn default_close_restart() -> u32 {
    10
}
fn default_rebuild_increment() -> i64 {
    4
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            reconfiguration_message_retry_interval_ms: default_retry_interval(),
            min_get_lsn_wait_duration_ms: 0,
            reconfiguration_health_report_threshold_ms: default_health_threshold(),
            is_deactivation_info_enabled: true,
            skip_phase3_deactivate_when_configuration_unchanged: true,
            replica_open_failure_warning_threshold: default_open_warning(),
            replica_open_failure_max_retry: default_open_max_retry(),
            replica_reopen_failure_max_retry: default_reopen_max_retry(),
            replica_close_failure_warning_threshold: default_close_warning(),
            replica_close_failure_restart_threshold: default_close_restart(),
            rebuild_primary_epoch_increment: default_rebuild_increment(),
        }
    }
}

impl FailoverConfig {
    pub fn message_retry_interval(&self) -> Duration {
        Duration::milliseconds(self.reconfiguration_message_retry_interval_ms as i64)
    }

    pub fn min_get_lsn_wait_duration(&self) -> Duration {
        Duration::milliseconds(self.min_get_lsn_wait_duration_ms as i64)
    }

    pub fn health_report_threshold(&self) -> Duration {
        Duration::milliseconds(self.reconfiguration_health_report_threshold_ms as i64)
    }

    pub fn validate(&self) -> RaResult<()> {
        if self.reconfiguration_message_retry_interval_ms == 0 {
            return Err(RaError::configuration(
                "reconfiguration_message_retry_interval_ms must be > 0",
            ));
        }

        if self.reconfiguration_health_report_threshold_ms == 0 {
            return Err(RaError::configuration(
                "reconfiguration_health_report_threshold_ms must be > 0",
            ));
        }

        if self.replica_open_failure_warning_threshold > self.replica_open_failure_max_retry {
            return Err(RaError::configuration(format!(
                "replica_open_failure_warning_threshold ({}) exceeds replica_open_failure_max_retry ({})",
                self.replica_open_failure_warning_threshold, self.replica_open_failure_max_retry
            )));
        }

        if self.replica_close_failure_warning_threshold
            > self.replica_close_failure_restart_threshold
        {
            return Err(RaError::configuration(format!(
                "replica_close_failure_warning_threshold ({}) exceeds replica_close_failure_restart_threshold ({})",
                self.replica_close_failure_warning_threshold,
                self.replica_close_failure_restart_threshold
            )));
        }

        if self.rebuild_primary_epoch_increment < 1 {
            return Err(RaError::configuration(
                "rebuild_primary_epoch_increment must be >= 1",
            ));
        }

        Ok(())
    }
}
