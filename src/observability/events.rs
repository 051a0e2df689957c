//! Observable events
//!
//! Every log line emitted by the reconfiguration agent and the rebuild path
//! names one of these.

use std::fmt;

use super::logger::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Reconfiguration lifecycle
    ReconfigurationStart,
    ReconfigurationPhaseStart,
    ReconfigurationComplete,
    ReconfigurationAbortSwapPrimary,
    /// Phase1 picked a remote primary and handed the decision back to FM
    ChangeConfiguration,
    DataLossDetected,
    /// Phase has run past the health report threshold
    ReconfigurationStuck,

    // Messaging
    StaleMessageDropped,
    MessageResend,

    // Local replica
    ReplicaCloseStart,
    RetryableErrorThreshold,
    IdleReplicaAdded,
    IdleReplicaRemoved,

    // Rebuild
    RebuildReportAdded,
    RebuildGenerated,
    RebuildNotGenerated,

    // Config / CLI
    ConfigLoaded,

    /// Internal consistency check failed (FATAL)
    InvariantViolation,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ReconfigurationStart => "RECONFIGURATION_START",
            Event::ReconfigurationPhaseStart => "RECONFIGURATION_PHASE_START",
            Event::ReconfigurationComplete => "RECONFIGURATION_COMPLETE",
            Event::ReconfigurationAbortSwapPrimary => "RECONFIGURATION_ABORT_SWAP_PRIMARY",
            Event::ChangeConfiguration => "CHANGE_CONFIGURATION",
            Event::DataLossDetected => "DATA_LOSS_DETECTED",
            Event::ReconfigurationStuck => "RECONFIGURATION_STUCK",
            Event::StaleMessageDropped => "STALE_MESSAGE_DROPPED",
            Event::MessageResend => "MESSAGE_RESEND",
            Event::ReplicaCloseStart => "REPLICA_CLOSE_START",
            Event::RetryableErrorThreshold => "RETRYABLE_ERROR_THRESHOLD",
            Event::IdleReplicaAdded => "IDLE_REPLICA_ADDED",
            Event::IdleReplicaRemoved => "IDLE_REPLICA_REMOVED",
            Event::RebuildReportAdded => "REBUILD_REPORT_ADDED",
            Event::RebuildGenerated => "REBUILD_GENERATED",
            Event::RebuildNotGenerated => "REBUILD_NOT_GENERATED",
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::InvariantViolation => "INVARIANT_VIOLATION",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::InvariantViolation)
    }

    pub fn severity(&self) -> Severity {
        match self {
            Event::InvariantViolation => Severity::Fatal,
            Event::DataLossDetected
            | Event::ReconfigurationStuck
            | Event::RetryableErrorThreshold => Severity::Warn,
            Event::StaleMessageDropped | Event::MessageResend | Event::RebuildReportAdded => {
                Severity::Trace
            }
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invariant_violation_is_fatal() {
        assert!(Event::InvariantViolation.is_fatal());
        assert!(!Event::DataLossDetected.is_fatal());
        assert_eq!(Event::InvariantViolation.severity(), Severity::Fatal);
    }

    #[test]
    fn test_names_are_upper_snake() {
        for event in [
            Event::ReconfigurationStart,
            Event::ChangeConfiguration,
            Event::RebuildNotGenerated,
        ] {
            let name = event.as_str();
            assert!(name.chars().all(|c| c.is_ascii_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_data_loss_is_warning() {
        assert_eq!(Event::DataLossDetected.severity(), Severity::Warn);
        assert_eq!(Event::MessageResend.severity(), Severity::Trace);
    }
}
