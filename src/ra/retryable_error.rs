//! Retry bookkeeping for local replica operations
//!
//! Open, reopen, change role and close are retried by the hosting layer.
//! Each attempt outcome is fed back here; the returned action tells the
//! failover unit whether to escalate health or give up on the replica.

use serde::Serialize;

use super::config::FailoverConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum RetryableErrorStateName {
    #[default]
    None,
    ReplicaOpen,
    ReplicaReopen,
    ReplicaChangeRoleAtCatchup,
    ReplicaClose,
    ReplicaDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RetryableErrorAction {
    None,
    ReportHealthWarning,
    ReportHealthError,
    ClearHealthReport,
    /// Stop retrying and drop the replica
    Drop,
    /// Stop retrying and restart the replica
    Restart,
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    report: u32,
    give_up: u32,
    report_action: RetryableErrorAction,
    give_up_action: RetryableErrorAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryableErrorState {
    current: RetryableErrorStateName,
    failure_count: u32,
    health_reported: bool,
}

impl RetryableErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> RetryableErrorStateName {
        self.current
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn is_health_reported(&self) -> bool {
        self.health_reported
    }

    /// Start counting failures for a new operation. Re-entering the same
    /// state keeps the count.
    pub fn enter_state(&mut self, name: RetryableErrorStateName) {
        if self.current == name {
            return;
        }
        self.current = name;
        self.failure_count = 0;
    }

    pub fn on_failure(&mut self, config: &FailoverConfig) -> RetryableErrorAction {
        let Some(thresholds) = self.thresholds(config) else {
            return RetryableErrorAction::None;
        };

        self.failure_count += 1;

        if self.failure_count >= thresholds.give_up {
            self.failure_count = 0;
            return thresholds.give_up_action;
        }

        if self.failure_count >= thresholds.report && !self.health_reported {
            self.health_reported = true;
            return thresholds.report_action;
        }

        RetryableErrorAction::None
    }

    /// Record success and move on to `next`. Returns ClearHealthReport when an
    /// earlier escalation needs to be withdrawn.
    pub fn on_success_and_transition_to(
        &mut self,
        next: RetryableErrorStateName,
    ) -> RetryableErrorAction {
        self.current = next;
        self.failure_count = 0;
        if self.health_reported {
            self.health_reported = false;
            RetryableErrorAction::ClearHealthReport
        } else {
            RetryableErrorAction::None
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn thresholds(&self, config: &FailoverConfig) -> Option<Thresholds> {
        let thresholds = match self.current {
            RetryableErrorStateName::None => return None,
            RetryableErrorStateName::ReplicaOpen => Thresholds {
                report: config.replica_open_failure_warning_threshold,
                give_up: config.replica_open_failure_max_retry,
                report_action: RetryableErrorAction::ReportHealthWarning,
                give_up_action: RetryableErrorAction::Drop,
            },
            RetryableErrorStateName::ReplicaReopen => Thresholds {
                report: config.replica_open_failure_warning_threshold,
                give_up: config.replica_reopen_failure_max_retry,
                report_action: RetryableErrorAction::ReportHealthWarning,
                give_up_action: RetryableErrorAction::Drop,
            },
            RetryableErrorStateName::ReplicaChangeRoleAtCatchup => Thresholds {
                report: config.replica_open_failure_warning_threshold,
                give_up: config.replica_open_failure_max_retry,
                report_action: RetryableErrorAction::ReportHealthError,
                give_up_action: RetryableErrorAction::Restart,
            },
            RetryableErrorStateName::ReplicaClose | RetryableErrorStateName::ReplicaDelete => {
                Thresholds {
                    report: config.replica_close_failure_warning_threshold,
                    give_up: config.replica_close_failure_restart_threshold,
                    report_action: RetryableErrorAction::ReportHealthWarning,
                    give_up_action: RetryableErrorAction::Drop,
                }
            }
        };
        Some(thresholds)
    }
}
