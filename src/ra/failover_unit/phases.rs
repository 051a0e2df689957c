//! Reconfiguration phases on the primary
//!
//! Phase1 collects progress from the previous and current configuration and
//! picks the replica with the most data. Phase2 waits for the local
//! replicator to catch up. Phase3 deactivates the previous configuration and
//! Phase4 activates the current one.

use crate::observability::{log_event_with_fields, Event};
use crate::reliability::{
    ConfigurationMessageBody, DoReconfigurationMessageBody, FailoverUnitDescription,
    GetLsnReplyMessageBody, ReplicaDeactivationInfo, ReplicaDescription,
    ReplicaReplyMessageBody, ReplicaRole, ReplicaState, ReplyError, INVALID_LSN,
};

use super::super::action_queue::{
    FmMessage, ProxyMessage, RaMessage, ReplicaCloseMode, UpdateConfigurationMode,
};
use super::super::context::ExecutionContext;
use super::super::errors::RaResult;
use super::super::health::ReplicaHealthEvent;
use super::super::reconfiguration_state::{
    ReconfigurationProgressStages, ReconfigurationStage, ReconfigurationType, ReplicaSetCounts,
};
use super::super::replica::{Replica, ReplicaMessageStage, ReplicaStates};
use super::super::retryable_error::{RetryableErrorAction, RetryableErrorStateName};
use super::FailoverUnit;

impl FailoverUnit {
    // ========================================================================
    // Phase1: GetLSN
    // ========================================================================

    pub(super) fn start_phase1_get_lsn(&mut self, ctx: &mut ExecutionContext<'_>) {
        self.log_stage(Event::ReconfigurationPhaseStart);

        for replica in self.replicas.configuration_remote_mut() {
            if !replica.is_dropped() {
                replica.message_stage = ReplicaMessageStage::RaReplyPending;
            }
        }
        self.replicas.local_mut().message_stage = ReplicaMessageStage::RaProxyReplyPending;

        let mut sent = false;
        for replica in self.replicas.configuration() {
            sent |= self.send_get_lsn(replica, ctx);
        }
        if sent {
            self.set_message_retry_active(true, ctx);
        }

        self.check_reconfiguration_progress_and_health(ctx);
    }

    /// Returns the progress and, once Phase1 is over, the node of the new
    /// primary.
    pub(super) fn check_phase1_get_lsn_progress(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
    ) -> (ReconfigurationProgressStages, Option<u64>) {
        let mut pc = ReplicaSetCounts::default();
        let mut cc = ReplicaSetCounts::default();

        for replica in self.replicas.configuration() {
            if replica.is_in_previous_configuration() {
                tally_get_lsn(&mut pc, replica);
            }
            if replica.is_in_current_configuration() {
                tally_get_lsn(&mut cc, replica);
            }
        }

        self.reconfiguration.set_get_lsn_counts(pc, cc);

        let has_previous = self.previous_configuration_epoch().is_valid();
        let pc_below_quorum = has_previous && pc.is_below_read_quorum();
        let cc_below_quorum = cc.is_below_read_quorum();

        if self.reconfiguration.reconfiguration_elapsed(ctx.now)
            < ctx.config.min_get_lsn_wait_duration()
            && (pc.up_waiting_count > 0 || cc.up_waiting_count > 0)
        {
            return (ReconfigurationProgressStages::Phase1UpReplicasPending, None);
        }

        if (pc_below_quorum && pc.waiting_count() > 0)
            || (cc_below_quorum && cc.waiting_count() > 0)
        {
            return (ReconfigurationProgressStages::Phase1WaitingForReadQuorum, None);
        }

        if self.reconfiguration.reconfiguration_type() != ReconfigurationType::SwapPrimary {
            let cc_data_loss_version = self.current_configuration_epoch().data_loss_version;
            let pc_data_loss_version = self.previous_configuration_epoch().data_loss_version;
            let pc_lost = pc_below_quorum && cc_data_loss_version == pc_data_loss_version;
            let cc_lost = cc_below_quorum
                && self
                    .data_loss_version_to_report
                    .map_or(true, |reported| cc_data_loss_version <= reported);

            if pc_lost || cc_lost {
                self.data_loss_version_to_report = Some(cc_data_loss_version);
                self.send_data_loss_report(ctx);
                ctx.metrics.increment_data_loss_reports();
                log_event_with_fields(
                    Event::DataLossDetected,
                    &[
                        ("failover_unit", &self.failover_unit_id().to_string()),
                        ("epoch", &self.current_configuration_epoch().to_string()),
                        ("pc_completed", &pc.completed_count.to_string()),
                        ("cc_completed", &cc.completed_count.to_string()),
                    ],
                );
                return (ReconfigurationProgressStages::Phase1DataLoss, None);
            }
        }

        match self.try_find_primary(ctx) {
            Some(primary) => (ReconfigurationProgressStages::CurrentPhaseFinished, Some(primary)),
            None => (ReconfigurationProgressStages::Phase1NoEligiblePrimary, None),
        }
    }

    /// The replica with the highest last LSN among those that replied.
    fn try_find_primary(&self, ctx: &ExecutionContext<'_>) -> Option<u64> {
        let mut eligible: Vec<&Replica> = self
            .replicas
            .configuration()
            .filter(|r| !r.is_dropped() && r.is_lsn_set() && !r.is_lsn_unknown())
            .collect();

        if eligible.is_empty() {
            return Some(self.find_primary_during_data_loss());
        }

        let all_have_deactivation_info = eligible.iter().all(|r| r.deactivation_info.is_valid());
        if all_have_deactivation_info && ctx.config.is_deactivation_info_enabled {
            remove_replicas_with_old_deactivation_epoch(&mut eligible);
        }

        if eligible.is_empty() {
            return Some(self.find_primary_during_data_loss());
        }

        let highest = eligible
            .iter()
            .map(|r| r.last_acknowledged_lsn())
            .max()
            .unwrap_or(INVALID_LSN);
        let primary = eligible
            .iter()
            .find(|r| r.is_up && r.last_acknowledged_lsn() == highest)?;

        let local = self.replicas.local_node_id();
        if self.reconfiguration.reconfiguration_type() == ReconfigurationType::Failover
            && primary.node.id == local
        {
            return Some(find_primary_with_best_catchup_capability(&eligible, local));
        }

        Some(primary.node.id)
    }

    /// Nobody has usable progress. Take whoever is furthest ahead, falling
    /// back to the local replica.
    fn find_primary_during_data_loss(&self) -> u64 {
        let mut best: Option<&Replica> = None;
        for replica in self
            .replicas
            .configuration()
            .filter(|r| !r.is_dropped() && r.is_lsn_set())
        {
            let better = best
                .map(|b| replica.last_acknowledged_lsn() > b.last_acknowledged_lsn())
                .unwrap_or(true);
            if better {
                best = Some(replica);
            }
        }

        best.map(|r| r.node.id)
            .unwrap_or_else(|| self.replicas.local_node_id())
    }

    pub(super) fn finish_phase1_get_lsn(&mut self, primary: u64, ctx: &mut ExecutionContext<'_>) {
        if !self.replicas.local().is_lsn_set() {
            let mode = if self.has_persisted_state() {
                ReplicaCloseMode::Restart
            } else {
                ReplicaCloseMode::Drop
            };
            self.start_close_local_replica(mode, None, ctx);
            return;
        }

        if primary != self.replicas.local_node_id() {
            let body = self.change_configuration_body(primary);
            self.change_configuration = Some(body.clone());
            self.on_phase_changed(ctx);

            ctx.queue.send_to_fm(FmMessage::ChangeConfiguration(body));
            ctx.metrics.increment_change_configurations();
            log_event_with_fields(
                Event::ChangeConfiguration,
                &[
                    ("failover_unit", &self.failover_unit_id().to_string()),
                    ("primary", &primary.to_string()),
                    ("epoch", &self.current_configuration_epoch().to_string()),
                ],
            );

            self.reconfiguration.finish_with_change_configuration();
            self.revert_configuration();
            return;
        }

        self.on_phase_changed(ctx);
        self.start_phase2_catchup_on_failover(ctx);
    }

    /// Configuration proposed to FM when another replica should be primary.
    /// Only the chosen replica carries its progress.
    fn change_configuration_body(&self, primary: u64) -> ConfigurationMessageBody {
        ConfigurationMessageBody {
            failover_unit: self.description,
            service: self.service.clone(),
            replicas: self
                .replicas
                .configuration()
                .map(|r| {
                    let mut desc = r.replica_description();
                    if r.node.id != primary {
                        desc.first_acknowledged_lsn = INVALID_LSN;
                        desc.last_acknowledged_lsn = INVALID_LSN;
                    }
                    desc
                })
                .collect(),
        }
    }

    // ========================================================================
    // Phase2: Catchup
    // ========================================================================

    fn start_phase2_catchup_on_failover(&mut self, ctx: &mut ExecutionContext<'_>) {
        self.reconfiguration.start_phase2_catchup(ctx.now);
        self.log_stage(Event::ReconfigurationPhaseStart);
        self.update_local_state_on_phase2_catchup();

        let local_first = self.replicas.local().first_acknowledged_lsn();
        let local_last = self.replicas.local().last_acknowledged_lsn();
        for replica in self.replicas.configuration_remote_mut() {
            replica.message_stage = ReplicaMessageStage::None;
            let restart = is_restart_needed_after_get_lsn(local_first, local_last, replica);
            replica.try_clear_unknown_lsn();
            if restart {
                replica.to_be_restarted = true;
            }
        }

        self.process_msg_resends(ctx);
    }

    /// Phase2 entered directly, without GetLSN.
    pub(super) fn start_phase2_catchup(&mut self, ctx: &mut ExecutionContext<'_>) {
        self.log_stage(Event::ReconfigurationPhaseStart);
        self.update_local_state_on_phase2_catchup();
        self.process_msg_resends(ctx);
    }

    fn update_local_state_on_phase2_catchup(&mut self) {
        self.retryable_error
            .enter_state(RetryableErrorStateName::ReplicaChangeRoleAtCatchup);

        let is_primary_change = self.description.is_primary_change_between_pc_and_cc();
        let cc = self.current_configuration_epoch();
        let local = self.replicas.local_mut();
        local.message_stage = ReplicaMessageStage::None;

        if is_primary_change && local.is_lsn_set() {
            let local_last = local.last_acknowledged_lsn();
            if self.deactivation_info.is_dropped() || local_last < self.deactivation_info.catchup_lsn
            {
                self.deactivation_info = ReplicaDeactivationInfo::new(cc, local_last);
            }
        }

        if local.is_standby() {
            local.state = ReplicaStates::InBuild;
        }
        self.update_replicator_configuration = false;
    }

    /// The local replicator finished catching up the configuration.
    ///
    /// `local` is the replicator's view of the local replica; its last LSN
    /// becomes the catchup boundary after a primary change.
    pub fn process_catchup_completed(
        &mut self,
        error: ReplyError,
        local: &ReplicaDescription,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        if !self.reconfiguration.is_catchup_stage() {
            return self.drop_stale(ctx, "UpdateConfigurationReply");
        }

        match error {
            ReplyError::Success | ReplyError::StateChangedOnDataLoss => {}
            ReplyError::Failed => {
                self.process_change_role_failure(ctx);
                return self.complete(true);
            }
            _ => return self.drop_stale(ctx, "UpdateConfigurationReply"),
        }

        let action = self
            .retryable_error
            .on_success_and_transition_to(RetryableErrorStateName::None);
        if action == RetryableErrorAction::ClearHealthReport {
            ctx.queue
                .report_health(ReplicaHealthEvent::ClearHealth);
        }

        let is_primary_change = self.description.is_primary_change_between_pc_and_cc();
        if is_primary_change {
            self.replicas.local_mut().state = ReplicaStates::Ready;
        }

        if self.reconfiguration.stage() == ReconfigurationStage::Phase0Demote {
            self.finish_demote(ctx);
            return self.complete(true);
        }

        if is_primary_change && local.last_acknowledged_lsn != INVALID_LSN {
            self.deactivation_info = ReplicaDeactivationInfo::new(
                self.current_configuration_epoch(),
                local.last_acknowledged_lsn,
            );
        }

        if error == ReplyError::StateChangedOnDataLoss {
            for replica in self.replicas.configuration_remote_mut() {
                if replica.is_up && replica.is_ready() {
                    replica.to_be_restarted = true;
                }
            }
        }

        self.on_phase_changed(ctx);
        self.start_phase3_deactivate(ctx);
        self.complete(true)
    }

    fn process_change_role_failure(&mut self, ctx: &mut ExecutionContext<'_>) {
        match self.retryable_error.on_failure(ctx.config) {
            RetryableErrorAction::ReportHealthError => {
                self.log_retry_threshold();
                ctx.queue.report_health(ReplicaHealthEvent::Error {
                    failure_count: self.retryable_error.failure_count(),
                });
            }
            RetryableErrorAction::Restart => {
                self.log_retry_threshold();
                let mode = if self.has_persisted_state() {
                    ReplicaCloseMode::Restart
                } else {
                    ReplicaCloseMode::Drop
                };
                self.start_close_local_replica(mode, None, ctx);
            }
            _ => {}
        }
    }

    /// The old primary has caught up the new one; hand over.
    fn finish_demote(&mut self, ctx: &mut ExecutionContext<'_>) {
        self.reconfiguration.finish_demote(ctx.now);
        self.on_phase_changed(ctx);
        for replica in self.replicas.configuration_remote_mut() {
            replica.to_be_deactivated = false;
        }
        self.log_stage(Event::ReconfigurationComplete);

        let Some(primary) = self.replicas.current_primary().map(|r| r.node) else {
            return;
        };
        let continuation = DoReconfigurationMessageBody {
            failover_unit: self.description,
            service: self.service.clone(),
            replicas: self
                .replicas
                .configuration()
                .map(|r| r.replica_description())
                .collect(),
            phase0_duration: self.reconfiguration.phase0_duration(),
        };
        ctx.queue.send_to_ra(
            primary,
            RaMessage::ContinueSwapPrimary(continuation),
        );
    }

    pub(super) fn start_abort_phase0_demote(&mut self, ctx: &mut ExecutionContext<'_>) {
        self.reconfiguration.start_abort_phase0_demote(ctx.now);
        self.log_stage(Event::ReconfigurationPhaseStart);
        ctx.queue.send_to_proxy(ProxyMessage::CancelCatchup(
            self.replicas.local().replica_description(),
        ));
        self.set_message_retry_active(true, ctx);
    }

    /// The replicator answered CancelCatchup. Either the swap is undone or
    /// the demotion raced ahead and finished anyway.
    pub fn process_cancel_catchup_reply(
        &mut self,
        failover_unit: &FailoverUnitDescription,
        error: ReplyError,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        if self.reconfiguration.stage() != ReconfigurationStage::AbortPhase0Demote
            || failover_unit.current_configuration_epoch != self.current_configuration_epoch()
        {
            return self.drop_stale(ctx, "CancelCatchupReply");
        }

        self.update_replicator_configuration = false;

        match error {
            ReplyError::Success => {
                self.reconfiguration.finish_abort_swap_primary();
                self.revert_configuration();
                self.on_phase_changed(ctx);
                self.log_stage(Event::ReconfigurationAbortSwapPrimary);
            }
            ReplyError::DemoteCompleted => self.finish_demote(ctx),
            _ => return self.drop_stale(ctx, "CancelCatchupReply"),
        }

        self.complete(true)
    }

    // ========================================================================
    // Phase3: Deactivate
    // ========================================================================

    pub(super) fn start_phase3_deactivate(&mut self, ctx: &mut ExecutionContext<'_>) {
        if self.should_skip_phase3_deactivate(ctx) {
            self.start_phase4_activate(ctx);
            return;
        }

        self.reconfiguration.start_phase3_deactivate(ctx.now);
        self.log_stage(Event::ReconfigurationPhaseStart);
        self.intermediate_configuration_epoch = self.current_configuration_epoch();

        let local = self.replicas.local_mut();
        local.ic_role = local.cc_role;

        for replica in self.replicas.configuration_remote_mut() {
            replica.ic_role = replica.cc_role;
            if replica.is_in_previous_configuration() && !replica.is_dropped() {
                replica.message_stage = ReplicaMessageStage::RaReplyPending;
            }
        }

        self.process_msg_resends(ctx);
        self.check_reconfiguration_progress_and_health(ctx);
    }

    fn should_skip_phase3_deactivate(&self, ctx: &ExecutionContext<'_>) -> bool {
        let has_live_previous = self
            .replicas
            .configuration_remote()
            .any(|r| r.is_in_previous_configuration() && !r.is_dropped());
        if !has_live_previous {
            return true;
        }

        ctx.config.skip_phase3_deactivate_when_configuration_unchanged
            && self
                .replicas
                .configuration()
                .all(|r| r.is_in_previous_configuration() && r.is_in_current_configuration())
    }

    pub(super) fn check_phase3_deactivate_progress(&self) -> ReconfigurationProgressStages {
        let mut pc = ReplicaSetCounts::default();

        for replica in self.replicas.previous_configuration() {
            pc.replica_count += 1;
            if replica.message_stage == ReplicaMessageStage::None || replica.is_dropped() {
                pc.completed_count += 1;
            } else if replica.is_up && !replica.is_build_in_progress() && !replica.to_be_restarted {
                pc.up_waiting_count += 1;
            }
        }

        if pc.is_below_read_quorum() {
            ReconfigurationProgressStages::Phase3PCBelowReadQuorum
        } else if pc.up_waiting_count > 0 {
            ReconfigurationProgressStages::Phase3WaitingForReplicas
        } else {
            ReconfigurationProgressStages::CurrentPhaseFinished
        }
    }

    // ========================================================================
    // Phase4: Activate
    // ========================================================================

    pub(super) fn start_phase4_activate(&mut self, ctx: &mut ExecutionContext<'_>) {
        self.intermediate_configuration_epoch = self.current_configuration_epoch();
        self.reconfiguration.start_phase4_activate(ctx.now);
        self.log_stage(Event::ReconfigurationPhaseStart);

        let is_local_primary = self.is_local_primary();
        let local = self.replicas.local_mut();
        local.ic_role = local.cc_role;
        if is_local_primary {
            local.message_stage = ReplicaMessageStage::RaProxyReplyPending;
        }

        for replica in self.replicas.configuration_remote_mut() {
            replica.message_stage = ReplicaMessageStage::None;
            replica.ic_role = replica.cc_role;
            if !replica.is_in_current_configuration() || replica.is_dropped() {
                continue;
            }
            if replica.is_inbuild() && replica.to_be_deactivated {
                replica.to_be_deactivated = false;
                replica.to_be_activated = true;
            }
            replica.message_stage = ReplicaMessageStage::RaReplyPending;
        }

        self.process_msg_resends(ctx);
        self.check_reconfiguration_progress_and_health(ctx);
    }

    pub(super) fn check_phase4_activate_progress(&self) -> ReconfigurationProgressStages {
        let mut up_ready_pending = false;
        let mut up_pending = false;
        let mut in_build = false;
        let mut restart_pending = false;
        let mut remove_pending = false;

        for replica in self.replicas.configuration_remote() {
            if replica.to_be_restarted {
                restart_pending = true;
                continue;
            }
            if replica.replicator_remove_pending {
                remove_pending = true;
                continue;
            }
            if !replica.is_in_current_configuration()
                || replica.message_stage == ReplicaMessageStage::None
            {
                continue;
            }

            if replica.is_inbuild() && replica.is_up {
                in_build = true;
            } else if replica.is_available() {
                up_ready_pending = true;
            } else if replica.is_up {
                up_pending = true;
            }
        }

        if up_ready_pending {
            ReconfigurationProgressStages::Phase4UpReadyReplicasPending
        } else if in_build {
            ReconfigurationProgressStages::Phase4ReplicaStuckIB
        } else if restart_pending {
            ReconfigurationProgressStages::Phase4ReplicaPendingRestart
        } else if self.replicas.local().message_stage != ReplicaMessageStage::None {
            ReconfigurationProgressStages::Phase4LocalReplicaNotReplied
        } else if self.update_replicator_configuration {
            ReconfigurationProgressStages::Phase4ReplicatorConfigurationUpdatePending
        } else if up_pending || remove_pending {
            ReconfigurationProgressStages::Phase4UpReadyReplicasActivated
        } else {
            ReconfigurationProgressStages::CurrentPhaseFinished
        }
    }

    /// Ask the replicator to grant write status once every up ready replica
    /// is activated. Returns true if a message was sent.
    pub(super) fn send_end_reconfiguration(&self, ctx: &mut ExecutionContext<'_>) -> bool {
        let all_activated = self.check_phase4_activate_progress()
            != ReconfigurationProgressStages::Phase4UpReadyReplicasPending;

        let local = self.replicas.local();
        let is_pending = local.cc_role == ReplicaRole::Primary
            && (self.update_replicator_configuration
                || (local.message_stage == ReplicaMessageStage::RaProxyReplyPending
                    && all_activated));
        if !is_pending {
            return false;
        }

        let mode = if all_activated {
            UpdateConfigurationMode::EndReconfiguration
        } else {
            UpdateConfigurationMode::None
        };
        self.send_update_configuration(mode, ctx);
        true
    }

    pub(super) fn send_update_configuration(
        &self,
        mode: UpdateConfigurationMode,
        ctx: &mut ExecutionContext<'_>,
    ) {
        ctx.queue.send_to_proxy(ProxyMessage::UpdateConfiguration {
            configuration: self.configuration_body(),
            mode,
        });
    }

    /// The replicator applied an UpdateConfiguration outside catchup.
    pub fn process_update_configuration_reply(
        &mut self,
        mode: UpdateConfigurationMode,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        if mode == UpdateConfigurationMode::Catchup {
            return self.drop_stale(ctx, "UpdateConfigurationReply");
        }

        let stage = self.reconfiguration.stage();
        let local_stage = self.replicas.local().message_stage;

        if self.is_local_primary() {
            self.update_replicator_configuration = false;
            if stage == ReconfigurationStage::Phase4Activate
                && local_stage == ReplicaMessageStage::RaProxyReplyPending
                && mode == UpdateConfigurationMode::EndReconfiguration
            {
                self.replicas.local_mut().message_stage = ReplicaMessageStage::None;
            }
            self.check_reconfiguration_progress_and_health(ctx);
            return self.complete(true);
        }

        if stage == ReconfigurationStage::None
            && local_stage == ReplicaMessageStage::RaProxyReplyPending
        {
            if let Some(sender) = self.sender_node {
                self.finish_activate();
                self.send_activate_reply(sender, ctx);
                return self.complete(true);
            }
        }

        self.drop_stale(ctx, "UpdateConfigurationReply")
    }

    // ========================================================================
    // Replies from remote replicas
    // ========================================================================

    pub fn process_get_lsn_reply(
        &mut self,
        body: &GetLsnReplyMessageBody,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        if !matches!(body.error, ReplyError::Success | ReplyError::NotFound)
            || !self.is_local_replica_open()
            || self.reconfiguration.stage() != ReconfigurationStage::Phase1GetLsn
            || body.failover_unit.current_configuration_epoch != self.current_configuration_epoch()
        {
            return self.drop_stale(ctx, "GetLSNReply");
        }

        let Some(replica) = self.replicas.get_mut(body.replica.node.id) else {
            return self.drop_stale(ctx, "GetLSNReply");
        };
        if replica.message_stage != ReplicaMessageStage::RaReplyPending
            || replica.instance_id != body.replica.instance_id
        {
            return self.drop_stale(ctx, "GetLSNReply");
        }

        replica.message_stage = ReplicaMessageStage::None;
        if body.error == ReplyError::NotFound {
            replica.set_lsn_unknown();
        } else if body.replica.is_dropped() {
            replica.mark_as_dropped();
        } else {
            replica.set_progress(&body.replica, body.deactivation_info);
        }

        self.check_reconfiguration_progress_and_health(ctx);
        self.complete(true)
    }

    /// The replicator reported the local progress. On the primary this feeds
    /// Phase1; on a secondary it answers the pending GetLSN.
    pub fn process_replicator_get_status_reply(
        &mut self,
        local: &ReplicaDescription,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        if self.reconfiguration.stage() == ReconfigurationStage::Phase1GetLsn {
            let info = self.deactivation_info;
            let replica = self.replicas.local_mut();
            if replica.message_stage != ReplicaMessageStage::RaProxyReplyPending {
                return self.drop_stale(ctx, "ReplicatorGetStatusReply");
            }
            replica.message_stage = ReplicaMessageStage::None;
            replica.set_progress(local, info);

            self.check_reconfiguration_progress_and_health(ctx);
            return self.complete(true);
        }

        let Some(sender) = self.sender_node.take() else {
            return self.drop_stale(ctx, "ReplicatorGetStatusReply");
        };

        let error = if self.deactivation_info.is_dropped() {
            ReplyError::NotFound
        } else {
            ReplyError::Success
        };
        let mut replica = self.replicas.local().replica_description();
        replica.first_acknowledged_lsn = local.first_acknowledged_lsn;
        replica.last_acknowledged_lsn = local.last_acknowledged_lsn;

        ctx.queue.send_to_ra(
            sender,
            RaMessage::GetLsnReply(GetLsnReplyMessageBody {
                failover_unit: self.description,
                replica,
                deactivation_info: self.deactivation_info,
                error,
            }),
        );
        self.complete(true)
    }

    pub fn process_deactivate_reply(
        &mut self,
        body: &ReplicaReplyMessageBody,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        let stage = self.reconfiguration.stage();
        let persisted = self.has_persisted_state();
        let node = body.replica.node.id;

        if self.replicas.is_local(node) {
            return self.drop_stale(ctx, "DeactivateReply");
        }
        let Some(replica) = self.replicas.get_mut(node) else {
            return self.drop_stale(ctx, "DeactivateReply");
        };
        if replica.instance_id != body.replica.instance_id {
            return self.drop_stale(ctx, "DeactivateReply");
        }

        let in_phase = matches!(
            stage,
            ReconfigurationStage::Phase0Demote
                | ReconfigurationStage::Phase2Catchup
                | ReconfigurationStage::Phase3Deactivate
                | ReconfigurationStage::Phase4Activate
        );
        if in_phase && replica.to_be_restarted {
            if persisted {
                // The restarted replica comes back with a new instance
                return self.drop_stale(ctx, "DeactivateReply");
            }
            replica.mark_as_dropped();
            self.check_reconfiguration_progress_and_health(ctx);
            return self.complete(true);
        }

        match stage {
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::Phase2Catchup => {
                if !(replica.is_inbuild() && replica.to_be_deactivated) {
                    return self.drop_stale(ctx, "DeactivateReply");
                }
                self.finish_deactivation_info_update(node, ctx);
            }
            ReconfigurationStage::Phase3Deactivate => {
                let is_pending_update = replica.is_inbuild() && replica.to_be_deactivated;
                let accepts = replica.is_standby() || is_pending_update || replica.is_ready();
                if !accepts || replica.message_stage != ReplicaMessageStage::RaReplyPending {
                    return self.drop_stale(ctx, "DeactivateReply");
                }
                replica.message_stage = ReplicaMessageStage::None;
                if is_pending_update {
                    self.finish_deactivation_info_update(node, ctx);
                }
                self.check_reconfiguration_progress_and_health(ctx);
            }
            _ => return self.drop_stale(ctx, "DeactivateReply"),
        }

        self.complete(true)
    }

    pub fn process_activate_reply(
        &mut self,
        body: &ReplicaReplyMessageBody,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        let stage = self.reconfiguration.stage();
        let node = body.replica.node.id;
        let incoming = &body.replica;

        let Some(replica) = self.replicas.get_mut(node) else {
            return self.drop_stale(ctx, "ActivateReply");
        };
        if replica.instance_id != incoming.instance_id
            || replica.message_stage != ReplicaMessageStage::RaReplyPending
            || !matches!(
                stage,
                ReconfigurationStage::Phase4Activate | ReconfigurationStage::None
            )
        {
            return self.drop_stale(ctx, "ActivateReply");
        }

        let rejected = match replica.state {
            ReplicaStates::Dropped | ReplicaStates::InCreate | ReplicaStates::InDrop => true,
            ReplicaStates::Ready => !incoming.is_ready(),
            ReplicaStates::StandBy => !matches!(
                incoming.state,
                ReplicaState::StandBy | ReplicaState::InBuild
            ),
            ReplicaStates::InBuild => !replica.to_be_activated || !incoming.is_ready(),
        };
        if rejected {
            return self.drop_stale(ctx, "ActivateReply");
        }

        replica.message_stage = ReplicaMessageStage::None;
        if replica.is_inbuild() {
            self.finish_deactivation_info_update(node, ctx);
        }

        if self
            .replicas
            .get(node)
            .map(|r| r.to_be_activated)
            .unwrap_or(false)
        {
            return self.complete(true);
        }

        if stage == ReconfigurationStage::Phase4Activate {
            self.check_reconfiguration_progress_and_health(ctx);
        } else if let Some(replica) = self.replicas.get(node) {
            ctx.queue.send_to_fm(FmMessage::AddReplicaReply(ReplicaReplyMessageBody {
                failover_unit: self.description,
                replica: replica.replica_description(),
                error: ReplyError::Success,
            }));
        }

        self.complete(true)
    }

    /// A built replica acknowledged the new epoch: it is now a ready member
    /// and the replicator has to learn about it.
    fn finish_deactivation_info_update(&mut self, node: u64, ctx: &mut ExecutionContext<'_>) {
        if let Some(replica) = self.replicas.get_mut(node) {
            replica.to_be_deactivated = false;
            replica.to_be_activated = false;
            replica.state = ReplicaStates::Ready;
        }

        self.mark_replication_configuration_update_pending();
        if !self.update_replicator_configuration {
            return;
        }

        let mode = if self.reconfiguration.is_catchup_stage() {
            UpdateConfigurationMode::Catchup
        } else {
            UpdateConfigurationMode::None
        };
        self.send_update_configuration(mode, ctx);
    }

    fn log_retry_threshold(&self) {
        log_event_with_fields(
            Event::RetryableErrorThreshold,
            &[
                ("failover_unit", &self.failover_unit_id().to_string()),
                ("operation", &format!("{:?}", self.retryable_error.current())),
                ("failures", &self.retryable_error.failure_count().to_string()),
            ],
        );
    }
}

fn tally_get_lsn(counts: &mut ReplicaSetCounts, replica: &Replica) {
    counts.replica_count += 1;
    if replica.is_dropped() {
        return;
    }

    if replica.is_lsn_set() {
        if !replica.is_lsn_unknown() {
            counts.completed_count += 1;
        }
    } else if replica.is_up {
        counts.up_waiting_count += 1;
    } else {
        counts.down_waiting_count += 1;
    }
}

/// Keep only candidates deactivated under the newest primary epoch, judged
/// among those that caught up to their deactivation boundary.
fn remove_replicas_with_old_deactivation_epoch(eligible: &mut Vec<&Replica>) {
    let newest = eligible
        .iter()
        .filter(|r| r.last_acknowledged_lsn() >= r.deactivation_info.catchup_lsn)
        .map(|r| r.deactivation_info.epoch.to_primary_epoch())
        .max();

    if let Some(newest) = newest {
        eligible.retain(|r| r.deactivation_info.epoch.to_primary_epoch() >= newest);
    }
}

/// The local replica has the most data. If another replica has the same
/// last LSN but keeps a shorter log, it can catch up the lagging replicas
/// with copy-free replication where the local replica cannot.
///
/// `eligible` must start with the local replica.
fn find_primary_with_best_catchup_capability(eligible: &[&Replica], local: u64) -> u64 {
    let Some(local_replica) = eligible.first().filter(|r| r.node.id == local) else {
        return local;
    };

    let local_first = local_replica.first_acknowledged_lsn();
    let local_last = local_replica.last_acknowledged_lsn();
    let mut candidate = *local_replica;
    let mut lowest_last = local_last;

    for replica in eligible.iter().skip(1) {
        let last = replica.last_acknowledged_lsn();
        if last < 0 || !replica.is_in_configuration() {
            continue;
        }

        if last == local_last {
            let first = replica.first_acknowledged_lsn();
            let candidate_first = candidate.first_acknowledged_lsn();
            if first > 0 && (candidate_first == 0 || first < candidate_first) {
                candidate = *replica;
            }
        } else if last < lowest_last {
            lowest_last = last;
        }
    }

    let found = candidate.node.id != local
        && lowest_last < local_last
        && (local_first > lowest_last + 1 || local_first == 0);

    if found {
        candidate.node.id
    } else {
        local
    }
}

/// A replica the new primary cannot catch up from its log has to restart
/// and be rebuilt.
fn is_restart_needed_after_get_lsn(local_first: i64, local_last: i64, replica: &Replica) -> bool {
    if !replica.is_up || !replica.is_in_current_configuration() || !replica.is_ready() {
        return false;
    }

    if !replica.is_lsn_set() || replica.is_lsn_unknown() {
        return true;
    }

    let remote_last = replica.last_acknowledged_lsn();
    local_last > remote_last && (local_first == 0 || remote_last < local_first - 1)
}
