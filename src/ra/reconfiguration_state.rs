//! Reconfiguration stage tracking
//!
//! `ReconfigurationState` is the single gate that says whether a
//! reconfiguration is running. Stage transitions are only made through the
//! `start_*` / `finish*` methods so the phase timer and result stay coherent.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ReconfigurationStage {
    #[default]
    None,
    /// Swap primary: existing primary demotes and catches up the new one
    Phase0Demote,
    Phase1GetLsn,
    Phase2Catchup,
    Phase3Deactivate,
    Phase4Activate,
    /// Swap primary cancelled by a newer primary epoch
    AbortPhase0Demote,
}

impl ReconfigurationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconfigurationStage::None => "None",
            ReconfigurationStage::Phase0Demote => "Phase0_Demote",
            ReconfigurationStage::Phase1GetLsn => "Phase1_GetLSN",
            ReconfigurationStage::Phase2Catchup => "Phase2_Catchup",
            ReconfigurationStage::Phase3Deactivate => "Phase3_Deactivate",
            ReconfigurationStage::Phase4Activate => "Phase4_Activate",
            ReconfigurationStage::AbortPhase0Demote => "Abort_Phase0_Demote",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ReconfigurationType {
    #[default]
    None,
    /// Primary is lost; elect one through GetLSN
    Failover,
    SwapPrimary,
    /// Primary unchanged; membership change only
    Other,
}

/// How the last reconfiguration ended. Used to answer duplicate
/// DoReconfiguration messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ReconfigurationResult {
    #[default]
    None,
    Completed,
    ChangeConfiguration,
    AbortSwapPrimary,
    DemoteCompleted,
}

/// Reason a progress check stopped where it did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ReconfigurationProgressStages {
    #[default]
    Invalid,
    Phase0NoReplyFromReplicator,
    Phase1WaitingForReadQuorum,
    Phase1UpReplicasPending,
    Phase1DataLoss,
    Phase1NoEligiblePrimary,
    Phase2NoReplyFromReplicator,
    Phase3PCBelowReadQuorum,
    Phase3WaitingForReplicas,
    Phase4UpReadyReplicasPending,
    Phase4ReplicaStuckIB,
    Phase4ReplicaPendingRestart,
    Phase4LocalReplicaNotReplied,
    Phase4ReplicatorConfigurationUpdatePending,
    Phase4UpReadyReplicasActivated,
    CurrentPhaseFinished,
}

/// Per-configuration tallies computed by Phase1 progress checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplicaSetCounts {
    pub replica_count: usize,
    pub completed_count: usize,
    pub up_waiting_count: usize,
    pub down_waiting_count: usize,
}

impl ReplicaSetCounts {
    pub fn read_quorum(&self) -> usize {
        (self.replica_count + 1) / 2
    }

    pub fn is_below_read_quorum(&self) -> bool {
        self.completed_count < self.read_quorum()
    }

    pub fn waiting_count(&self) -> usize {
        self.up_waiting_count + self.down_waiting_count
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconfigurationState {
    stage: ReconfigurationStage,
    reconfiguration_type: ReconfigurationType,
    result: ReconfigurationResult,
    start_time: Option<DateTime<Utc>>,
    phase_start_time: Option<DateTime<Utc>>,
    phase0_duration: Option<std::time::Duration>,
    progress: ReconfigurationProgressStages,
    pc_counts: ReplicaSetCounts,
    cc_counts: ReplicaSetCounts,
}

impl ReconfigurationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> ReconfigurationStage {
        self.stage
    }

    pub fn reconfiguration_type(&self) -> ReconfigurationType {
        self.reconfiguration_type
    }

    pub fn result(&self) -> ReconfigurationResult {
        self.result
    }

    pub fn phase0_duration(&self) -> Option<std::time::Duration> {
        self.phase0_duration
    }

    pub fn is_reconfiguring(&self) -> bool {
        self.stage != ReconfigurationStage::None
    }

    pub fn is_catchup_stage(&self) -> bool {
        matches!(
            self.stage,
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::Phase2Catchup
        )
    }

    pub fn is_swap_primary(&self) -> bool {
        self.reconfiguration_type == ReconfigurationType::SwapPrimary
    }

    /// Begin a reconfiguration. The first stage follows from the type.
    ///
    /// A swap primary that arrives with a phase0 duration is the continuation
    /// sent by the demoted primary, so the new primary goes straight to
    /// catchup.
    pub fn start(
        &mut self,
        reconfiguration_type: ReconfigurationType,
        phase0_duration: Option<std::time::Duration>,
        now: DateTime<Utc>,
    ) {
        self.reconfiguration_type = reconfiguration_type;
        self.phase0_duration = phase0_duration;
        self.result = ReconfigurationResult::None;
        self.start_time = Some(now);
        let stage = match reconfiguration_type {
            ReconfigurationType::Failover => ReconfigurationStage::Phase1GetLsn,
            ReconfigurationType::SwapPrimary if phase0_duration.is_none() => {
                ReconfigurationStage::Phase0Demote
            }
            _ => ReconfigurationStage::Phase2Catchup,
        };
        self.enter(stage, now);
    }

    pub fn start_phase2_catchup(&mut self, now: DateTime<Utc>) {
        self.enter(ReconfigurationStage::Phase2Catchup, now);
    }

    pub fn start_abort_phase0_demote(&mut self, now: DateTime<Utc>) {
        self.enter(ReconfigurationStage::AbortPhase0Demote, now);
    }

    pub fn start_phase3_deactivate(&mut self, now: DateTime<Utc>) {
        self.enter(ReconfigurationStage::Phase3Deactivate, now);
    }

    pub fn start_phase4_activate(&mut self, now: DateTime<Utc>) {
        self.enter(ReconfigurationStage::Phase4Activate, now);
    }

    pub fn finish(&mut self) {
        self.finish_with(ReconfigurationResult::Completed);
    }

    pub fn finish_with_change_configuration(&mut self) {
        self.finish_with(ReconfigurationResult::ChangeConfiguration);
    }

    pub fn finish_abort_swap_primary(&mut self) {
        self.finish_with(ReconfigurationResult::AbortSwapPrimary);
    }

    /// Old primary finished catching up the new one; the new primary drives
    /// the rest of the swap. The time spent demoting is kept so the
    /// continuation message can carry it.
    pub fn finish_demote(&mut self, now: DateTime<Utc>) {
        let demote_time = self
            .phase_elapsed(now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        self.finish_with(ReconfigurationResult::DemoteCompleted);
        self.phase0_duration = Some(demote_time);
    }

    /// Forget everything, including the last result.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn finish_with(&mut self, result: ReconfigurationResult) {
        self.stage = ReconfigurationStage::None;
        self.reconfiguration_type = ReconfigurationType::None;
        self.result = result;
        self.start_time = None;
        self.phase_start_time = None;
        self.phase0_duration = None;
        self.progress = ReconfigurationProgressStages::Invalid;
    }

    fn enter(&mut self, stage: ReconfigurationStage, now: DateTime<Utc>) {
        self.stage = stage;
        self.phase_start_time = Some(now);
        self.progress = ReconfigurationProgressStages::Invalid;
    }

    pub fn phase_elapsed(&self, now: DateTime<Utc>) -> Duration {
        self.phase_start_time
            .map(|start| now - start)
            .unwrap_or_else(Duration::zero)
    }

    pub fn reconfiguration_elapsed(&self, now: DateTime<Utc>) -> Duration {
        self.start_time
            .map(|start| now - start)
            .unwrap_or_else(Duration::zero)
    }

    pub fn progress(&self) -> ReconfigurationProgressStages {
        self.progress
    }

    /// Record the latest progress. Returns true if it changed.
    pub fn set_progress(&mut self, progress: ReconfigurationProgressStages) -> bool {
        let changed = self.progress != progress;
        self.progress = progress;
        changed
    }

    pub fn set_get_lsn_counts(&mut self, pc: ReplicaSetCounts, cc: ReplicaSetCounts) {
        self.pc_counts = pc;
        self.cc_counts = cc;
    }

    pub fn get_lsn_counts(&self) -> (ReplicaSetCounts, ReplicaSetCounts) {
        (self.pc_counts, self.cc_counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_start_picks_first_stage() {
        let mut state = ReconfigurationState::new();
        state.start(ReconfigurationType::Failover, None, now());
        assert_eq!(state.stage(), ReconfigurationStage::Phase1GetLsn);

        state.start(ReconfigurationType::SwapPrimary, None, now());
        assert_eq!(state.stage(), ReconfigurationStage::Phase0Demote);
        assert!(state.is_catchup_stage());

        state.start(ReconfigurationType::Other, None, now());
        assert_eq!(state.stage(), ReconfigurationStage::Phase2Catchup);

        state.start(
            ReconfigurationType::SwapPrimary,
            Some(std::time::Duration::from_secs(2)),
            now(),
        );
        assert_eq!(state.stage(), ReconfigurationStage::Phase2Catchup);
        assert!(state.is_swap_primary());
    }

    #[test]
    fn test_finish_demote_keeps_phase0_duration() {
        let mut state = ReconfigurationState::new();
        state.start(ReconfigurationType::SwapPrimary, None, now());
        state.finish_demote(now() + Duration::seconds(3));
        assert_eq!(state.result(), ReconfigurationResult::DemoteCompleted);
        assert_eq!(
            state.phase0_duration(),
            Some(std::time::Duration::from_secs(3))
        );
    }

    #[test]
    fn test_finish_records_result() {
        let mut state = ReconfigurationState::new();
        state.start(ReconfigurationType::Failover, None, now());
        assert!(state.is_reconfiguring());
        state.finish_with_change_configuration();
        assert!(!state.is_reconfiguring());
        assert_eq!(state.result(), ReconfigurationResult::ChangeConfiguration);
        assert_eq!(state.reconfiguration_type(), ReconfigurationType::None);
    }

    #[test]
    fn test_phase_timer_resets_on_transition() {
        let mut state = ReconfigurationState::new();
        state.start(ReconfigurationType::Other, None, now());
        let later = now() + Duration::seconds(30);
        assert_eq!(state.phase_elapsed(later), Duration::seconds(30));

        state.start_phase3_deactivate(later);
        assert_eq!(state.phase_elapsed(later), Duration::zero());
        assert_eq!(state.reconfiguration_elapsed(later), Duration::seconds(30));
    }

    #[test]
    fn test_read_quorum() {
        let counts = ReplicaSetCounts {
            replica_count: 3,
            completed_count: 1,
            up_waiting_count: 2,
            down_waiting_count: 0,
        };
        assert_eq!(counts.read_quorum(), 2);
        assert!(counts.is_below_read_quorum());

        let counts = ReplicaSetCounts {
            completed_count: 2,
            ..counts
        };
        assert!(!counts.is_below_read_quorum());

        assert!(!ReplicaSetCounts::default().is_below_read_quorum());
    }

    #[test]
    fn test_set_progress_reports_change() {
        let mut state = ReconfigurationState::new();
        assert!(state.set_progress(ReconfigurationProgressStages::Phase1WaitingForReadQuorum));
        assert!(!state.set_progress(ReconfigurationProgressStages::Phase1WaitingForReadQuorum));
    }
}
