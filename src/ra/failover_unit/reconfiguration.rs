//! DoReconfiguration handling and progress dispatch

use crate::observability::{log_event_with_fields, Event};
use crate::reliability::{
    DoReconfigurationMessageBody, Epoch, NodeInstance, ReplicaRole, ReplicaState,
};

use super::super::action_queue::{FmMessage, RaMessage};
use super::super::context::ExecutionContext;
use super::super::errors::{RaError, RaResult};
use super::super::reconfiguration_state::{
    ReconfigurationProgressStages, ReconfigurationResult, ReconfigurationStage,
    ReconfigurationType,
};
use super::super::replica::{Replica, ReplicaMessageStage, ReplicaStates};
use super::FailoverUnit;

impl FailoverUnit {
    /// Start, continue or abort a reconfiguration as instructed by FM.
    ///
    /// Also handles ContinueSwapPrimary from a demoted primary: the body
    /// then carries the time the demotion took.
    pub fn process_do_reconfiguration(
        &mut self,
        body: &DoReconfigurationMessageBody,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        let local_node = self.replicas.local_node_id();
        if body.primary().is_none() {
            return Err(RaError::invalid_message(format!(
                "DoReconfiguration for {} has no primary",
                self.failover_unit_id()
            )));
        }
        let Some(incoming_local) = body.find_replica(local_node).cloned() else {
            return Err(RaError::invalid_message(format!(
                "DoReconfiguration for {} does not include node {}",
                self.failover_unit_id(),
                local_node
            )));
        };

        if !self.is_local_replica_open() {
            return self.drop_stale(ctx, "DoReconfiguration");
        }

        let incoming_cc = body.failover_unit.current_configuration_epoch;
        if incoming_cc < self.current_configuration_epoch() {
            return self.drop_stale(ctx, "DoReconfiguration");
        }

        if !self.can_process_do_reconfiguration(body, ctx) {
            return self.complete(false);
        }

        if !self.try_abort_reconfiguration(body, ctx) {
            return self.complete(true);
        }

        self.description.current_configuration_epoch = incoming_cc;

        if !self.reconfiguration.is_reconfiguring() {
            self.sender_node = None;
            self.update_reconfiguration_epochs(body);

            let reconfiguration_type = self.identify_reconfiguration_type(body);
            self.reconfiguration
                .start(reconfiguration_type, body.phase0_duration, ctx.now);
            ctx.metrics.increment_reconfigurations_started();
            log_event_with_fields(
                Event::ReconfigurationStart,
                &[
                    ("failover_unit", &self.failover_unit_id().to_string()),
                    ("type", &format!("{:?}", reconfiguration_type)),
                    ("stage", self.reconfiguration.stage().as_str()),
                    ("epoch", &incoming_cc.to_string()),
                ],
            );

            {
                let local = self.replicas.local_mut();
                local.try_set_progress(&incoming_local);
                local.pc_role = incoming_local.previous_role;
                local.cc_role = incoming_local.current_role;
            }

            self.update_remote_replica_roles(body);
            self.update_remote_replica_states(body, true);
            self.start_reconfiguration(ctx);
        } else {
            if self.update_remote_replica_states(body, false) {
                self.mark_replication_configuration_update_pending();
            }

            self.check_reconfiguration_progress_and_health(ctx);
            if self.update_replicator_configuration
                && self.reconfiguration.is_reconfiguring()
                && !self.is_local_replica_closing()
            {
                self.process_msg_resends(ctx);
            }
        }

        self.complete(true)
    }

    /// A duplicate of an already finished reconfiguration is answered from
    /// the recorded result instead of being processed again.
    fn can_process_do_reconfiguration(
        &self,
        body: &DoReconfigurationMessageBody,
        ctx: &mut ExecutionContext<'_>,
    ) -> bool {
        if self.reconfiguration.is_reconfiguring()
            || body.failover_unit.current_configuration_epoch != self.current_configuration_epoch()
        {
            return true;
        }

        match self.reconfiguration.result() {
            ReconfigurationResult::DemoteCompleted => {
                if let Some(primary) = body.primary() {
                    let mut continuation = body.clone();
                    continuation.phase0_duration = self.reconfiguration.phase0_duration();
                    ctx.queue
                        .send_to_ra(primary.node, RaMessage::ContinueSwapPrimary(continuation));
                }
            }
            ReconfigurationResult::Completed => {
                ctx.queue
                    .send_to_fm(FmMessage::DoReconfigurationReply(self.configuration_body()));
            }
            ReconfigurationResult::ChangeConfiguration => {
                if let Some(change) = &self.change_configuration {
                    ctx.queue
                        .send_to_fm(FmMessage::ChangeConfiguration(change.clone()));
                }
            }
            _ => {
                self.log_stale(ctx, "DoReconfiguration");
            }
        }

        false
    }

    /// Returns false if the message must not be processed further.
    ///
    /// A newer primary epoch arriving while the local primary is still
    /// demoting aborts the swap; CC is left untouched until the abort
    /// finishes.
    fn try_abort_reconfiguration(
        &mut self,
        body: &DoReconfigurationMessageBody,
        ctx: &mut ExecutionContext<'_>,
    ) -> bool {
        if !self.reconfiguration.is_reconfiguring() {
            return true;
        }

        match self.reconfiguration.stage() {
            ReconfigurationStage::AbortPhase0Demote => {
                self.log_stale(ctx, "DoReconfiguration");
                false
            }
            _ if body.failover_unit.current_configuration_epoch.to_primary_epoch()
                <= self.current_configuration_epoch().to_primary_epoch() =>
            {
                true
            }
            ReconfigurationStage::Phase0Demote => {
                self.start_abort_phase0_demote(ctx);
                false
            }
            _ => true,
        }
    }

    fn update_reconfiguration_epochs(&mut self, body: &DoReconfigurationMessageBody) {
        self.intermediate_configuration_epoch = Epoch::INVALID;
        self.replicas.local_mut().ic_role = ReplicaRole::None;
        self.description.previous_configuration_epoch =
            body.failover_unit.previous_configuration_epoch;

        let local = self.replicas.local();
        if !(local.cc_role == ReplicaRole::Primary && local.is_ready()) {
            // A new primary only trusts the configuration FM sends
            self.replicas.retain_remote(|r| !r.is_in_configuration());
        }
    }

    fn identify_reconfiguration_type(
        &self,
        body: &DoReconfigurationMessageBody,
    ) -> ReconfigurationType {
        if body.phase0_duration.is_some() {
            return ReconfigurationType::SwapPrimary;
        }

        if !body.failover_unit.is_primary_change_between_pc_and_cc() {
            return ReconfigurationType::Other;
        }

        let local_node = self.replicas.local_node_id();
        if body
            .find_replica(local_node)
            .map(|r| r.current_role == ReplicaRole::Secondary)
            .unwrap_or(false)
        {
            return ReconfigurationType::SwapPrimary;
        }

        let result = self.reconfiguration.result();
        if result == ReconfigurationResult::AbortSwapPrimary {
            return ReconfigurationType::Other;
        }

        // Local is still the ready primary it was before this message
        let local = self.replicas.local();
        let stays_primary = body
            .find_replica(local_node)
            .map(|r| r.current_role == ReplicaRole::Primary)
            .unwrap_or(false);
        if result != ReconfigurationResult::ChangeConfiguration
            && local.cc_role == ReplicaRole::Primary
            && local.is_ready()
            && stays_primary
        {
            return ReconfigurationType::Other;
        }

        ReconfigurationType::Failover
    }

    /// Take roles from the message. Replicas the unit does not know yet are
    /// added; an InBuild replica being placed into the configuration starts
    /// as StandBy until the primary builds it.
    fn update_remote_replica_roles(&mut self, body: &DoReconfigurationMessageBody) {
        let local_node = self.replicas.local_node_id();

        for desc in body.replicas.iter().filter(|d| d.node.id != local_node) {
            match self.replicas.get_mut(desc.node.id) {
                Some(replica) => {
                    replica.ic_role = ReplicaRole::None;
                    replica.pc_role = desc.previous_role;
                    replica.cc_role = desc.current_role;
                }
                None => {
                    let replica = self.replicas.add_remote(Replica::new(desc));
                    let joins_configuration = matches!(
                        desc.current_role,
                        ReplicaRole::Primary | ReplicaRole::Secondary
                    );
                    if joins_configuration && desc.state == ReplicaState::InBuild {
                        replica.state = ReplicaStates::StandBy;
                    }
                }
            }
        }
    }

    /// Reconcile replica instance and up state with the message. Returns
    /// true if the replicator configuration has to be updated.
    fn update_remote_replica_states(
        &mut self,
        body: &DoReconfigurationMessageBody,
        is_starting: bool,
    ) -> bool {
        let local_node = self.replicas.local_node_id();
        let stage = self.reconfiguration.stage();
        let is_local_primary = self.is_local_primary();
        let is_remove_possible = stage != ReconfigurationStage::Phase1GetLsn && is_local_primary;
        let mut update_replicator_configuration = false;

        for incoming in body.replicas.iter().filter(|d| d.node.id != local_node) {
            let Some(replica) = self.replicas.get_mut(incoming.node.id) else {
                continue;
            };

            if replica.replicator_remove_pending {
                continue;
            }

            if replica.to_be_restarted {
                if incoming.instance_id > replica.instance_id || (replica.is_up && !incoming.is_up)
                {
                    replica.to_be_restarted = false;
                } else {
                    continue;
                }
            }

            if incoming.instance_id > replica.instance_id {
                if replica.is_up && (replica.is_inbuild() || !replica.is_in_current_configuration())
                {
                    replica.is_up = false;
                    if replica.is_inbuild() && is_remove_possible {
                        replica.replicator_remove_pending = true;
                        replica.to_be_activated = false;
                        replica.to_be_deactivated = false;
                        if is_starting {
                            replica.message_stage = ReplicaMessageStage::None;
                        }
                    }
                } else {
                    replica.update_instance(incoming);
                    update_replicator_configuration = true;
                }
            }

            if replica.instance_id != incoming.instance_id {
                continue;
            }

            if incoming.is_up {
                if replica.is_up
                    && replica.is_standby()
                    && incoming.state == ReplicaState::InBuild
                    && is_local_primary
                {
                    replica.state = ReplicaStates::InCreate;
                    if matches!(
                        stage,
                        ReconfigurationStage::Phase3Deactivate | ReconfigurationStage::Phase4Activate
                    ) && replica.message_stage == ReplicaMessageStage::None
                    {
                        replica.message_stage = ReplicaMessageStage::RaReplyPending;
                    }
                } else if incoming.state == ReplicaState::Ready && replica.is_up {
                    replica.state = ReplicaStates::Ready;
                } else if replica.is_up
                    && replica.is_inbuild()
                    && replica.to_be_activated
                    && incoming.state == ReplicaState::InBuild
                    && is_starting
                {
                    replica.to_be_activated = false;
                    replica.to_be_deactivated = true;
                    replica.message_stage = ReplicaMessageStage::None;
                }
            } else if replica.is_up {
                replica.is_up = false;
                update_replicator_configuration = true;

                let is_idle_in_catchup = replica.pc_role == ReplicaRole::Idle
                    && replica.cc_role == ReplicaRole::Secondary
                    && matches!(
                        stage,
                        ReconfigurationStage::Phase0Demote | ReconfigurationStage::Phase2Catchup
                    );
                if is_remove_possible && (replica.is_inbuild() || is_idle_in_catchup) {
                    replica.replicator_remove_pending = true;
                    replica.to_be_activated = false;
                    replica.to_be_deactivated = false;
                    update_replicator_configuration = false;
                    if is_starting {
                        replica.message_stage = ReplicaMessageStage::None;
                    }
                }
            } else if incoming.is_dropped() && !replica.is_dropped() {
                replica.mark_as_dropped();
            }
        }

        update_replicator_configuration
    }

    pub(super) fn mark_replication_configuration_update_pending(&mut self) {
        let pending = match self.reconfiguration.stage() {
            ReconfigurationStage::Phase1GetLsn | ReconfigurationStage::AbortPhase0Demote => false,
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::Phase2Catchup => true,
            ReconfigurationStage::Phase3Deactivate | ReconfigurationStage::Phase4Activate => {
                self.is_local_primary()
            }
            ReconfigurationStage::None => true,
        };

        if pending {
            self.update_replicator_configuration = true;
        }
    }

    fn start_reconfiguration(&mut self, ctx: &mut ExecutionContext<'_>) {
        match self.reconfiguration.stage() {
            ReconfigurationStage::Phase1GetLsn => self.start_phase1_get_lsn(ctx),
            _ => self.start_phase2_catchup(ctx),
        }
        self.set_message_retry_active(true, ctx);
    }

    /// Run the progress check of the current stage. A finished stage moves
    /// the reconfiguration on; otherwise the progress is recorded and a
    /// phase that has run too long is reported as stuck.
    pub(super) fn check_reconfiguration_progress_and_health(&mut self, ctx: &mut ExecutionContext<'_>) {
        let stage = self.reconfiguration.stage();
        let progress = match stage {
            ReconfigurationStage::None => return,
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::AbortPhase0Demote => {
                ReconfigurationProgressStages::Phase0NoReplyFromReplicator
            }
            ReconfigurationStage::Phase2Catchup => {
                ReconfigurationProgressStages::Phase2NoReplyFromReplicator
            }
            ReconfigurationStage::Phase1GetLsn => {
                let (progress, primary) = self.check_phase1_get_lsn_progress(ctx);
                if let Some(primary) = primary {
                    self.finish_phase1_get_lsn(primary, ctx);
                }
                progress
            }
            ReconfigurationStage::Phase3Deactivate => {
                let progress = self.check_phase3_deactivate_progress();
                if progress == ReconfigurationProgressStages::CurrentPhaseFinished {
                    self.on_phase_changed(ctx);
                    self.start_phase4_activate(ctx);
                }
                progress
            }
            ReconfigurationStage::Phase4Activate => {
                let progress = self.check_phase4_activate_progress();
                if progress == ReconfigurationProgressStages::CurrentPhaseFinished {
                    self.complete_reconfiguration(ctx);
                } else if progress != ReconfigurationProgressStages::Phase4UpReadyReplicasPending
                    && self.replicas.local().message_stage
                        == ReplicaMessageStage::RaProxyReplyPending
                {
                    self.send_end_reconfiguration(ctx);
                }
                progress
            }
        };

        if progress == ReconfigurationProgressStages::CurrentPhaseFinished
            || self.reconfiguration.stage() != stage
        {
            return;
        }

        self.reconfiguration.set_progress(progress);

        if self.reconfiguration.phase_elapsed(ctx.now) > ctx.config.health_report_threshold() {
            if let Some(event) = self.reconfiguration_health.report_stuck(stage, progress) {
                log_event_with_fields(
                    Event::ReconfigurationStuck,
                    &[
                        ("failover_unit", &self.failover_unit_id().to_string()),
                        ("stage", stage.as_str()),
                        ("progress", &format!("{:?}", progress)),
                    ],
                );
                ctx.queue.report_health(event);
            }
        }
    }

    /// Every stage change withdraws an outstanding stuck report.
    pub(super) fn on_phase_changed(&mut self, ctx: &mut ExecutionContext<'_>) {
        if let Some(event) = self.reconfiguration_health.clear() {
            ctx.queue.report_health(event);
        }
    }

    pub(super) fn complete_reconfiguration(&mut self, ctx: &mut ExecutionContext<'_>) {
        self.reset_reconfiguration_states();
        self.reconfiguration.finish();
        self.on_phase_changed(ctx);

        ctx.metrics.increment_reconfigurations_completed();
        self.log_stage(Event::ReconfigurationComplete);
        ctx.queue
            .send_to_fm(FmMessage::DoReconfigurationReply(self.configuration_body()));
    }

    /// The node hosting a remote replica went down. Idempotent.
    pub fn process_node_down(
        &mut self,
        node: NodeInstance,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        if self.replicas.is_local(node.id) {
            return Err(RaError::invalid_message(format!(
                "node down for local node {}",
                node.id
            )));
        }

        let Some(replica) = self.replicas.get_mut(node.id) else {
            return Ok(false);
        };
        if replica.node.instance > node.instance || !replica.is_up {
            return Ok(false);
        }

        replica.mark_down();
        if replica.is_in_configuration() {
            self.mark_replication_configuration_update_pending();
        }

        if self.reconfiguration.is_reconfiguring() {
            self.check_reconfiguration_progress_and_health(ctx);
        }

        self.complete(true)
    }
}
