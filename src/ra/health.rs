//! Health reports raised by the failover unit
//!
//! Reports are queued as actions; emitting them is left to the host.

use serde::Serialize;

use super::reconfiguration_state::{ReconfigurationProgressStages, ReconfigurationStage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ReplicaHealthEvent {
    OpenWarning { failure_count: u32 },
    CloseWarning { failure_count: u32 },
    /// Change role at catchup keeps failing
    Error { failure_count: u32 },
    /// A previously reported open/close/change-role problem went away
    ClearHealth,
    ReconfigurationStuck {
        stage: ReconfigurationStage,
        progress: ReconfigurationProgressStages,
    },
    ClearReconfigurationStuck,
}

/// Tracks whether a stuck-reconfiguration warning is outstanding so that it
/// is raised and cleared exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconfigurationHealthState {
    reported: Option<(ReconfigurationStage, ReconfigurationProgressStages)>,
}

impl ReconfigurationHealthState {
    pub fn is_reported(&self) -> bool {
        self.reported.is_some()
    }

    /// Returns the event to emit, if the reported state changed.
    pub fn report_stuck(
        &mut self,
        stage: ReconfigurationStage,
        progress: ReconfigurationProgressStages,
    ) -> Option<ReplicaHealthEvent> {
        if self.reported == Some((stage, progress)) {
            return None;
        }
        self.reported = Some((stage, progress));
        Some(ReplicaHealthEvent::ReconfigurationStuck { stage, progress })
    }

    pub fn clear(&mut self) -> Option<ReplicaHealthEvent> {
        self.reported
            .take()
            .map(|_| ReplicaHealthEvent::ClearReconfigurationStuck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stuck_reported_once() {
        let mut health = ReconfigurationHealthState::default();
        let stage = ReconfigurationStage::Phase1GetLsn;
        let progress = ReconfigurationProgressStages::Phase1WaitingForReadQuorum;

        assert!(health.report_stuck(stage, progress).is_some());
        assert!(health.report_stuck(stage, progress).is_none());
        assert!(health
            .report_stuck(stage, ReconfigurationProgressStages::Phase1DataLoss)
            .is_some());
    }

    #[test]
    fn test_clear_only_when_reported() {
        let mut health = ReconfigurationHealthState::default();
        assert!(health.clear().is_none());
        health.report_stuck(
            ReconfigurationStage::Phase3Deactivate,
            ReconfigurationProgressStages::Phase3WaitingForReplicas,
        );
        assert_eq!(
            health.clear(),
            Some(ReplicaHealthEvent::ClearReconfigurationStuck)
        );
        assert!(!health.is_reported());
    }
}
