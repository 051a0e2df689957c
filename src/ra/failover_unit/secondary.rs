//! Messages handled on the receiving side of a reconfiguration
//!
//! The primary drives; these handlers only adopt what it sends and reply.
//! Anything older than what this unit already knows is dropped.

use crate::reliability::{
    ActivateMessageBody, DeactivateMessageBody, Epoch, NodeInstance, ReplicaMessageBody,
    ReplicaReplyMessageBody, ReplicaRole, ReplicaState, ReplyError,
};

use super::super::action_queue::{ProxyMessage, RaMessage, ReplicaCloseMode, UpdateConfigurationMode};
use super::super::context::ExecutionContext;
use super::super::errors::{RaError, RaResult};
use super::super::replica::ReplicaMessageStage;
use super::FailoverUnit;

impl FailoverUnit {
    /// A new primary asks for the local progress. The answer comes from the
    /// replicator, see `process_replicator_get_status_reply`.
    pub fn process_get_lsn(
        &mut self,
        from: NodeInstance,
        body: &ReplicaMessageBody,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        if !self.is_local_replica_open() {
            return self.drop_stale(ctx, "GetLSN");
        }

        let incoming_cc = body.failover_unit.current_configuration_epoch;
        if incoming_cc < self.current_configuration_epoch() {
            return self.drop_stale(ctx, "GetLSN");
        }

        if incoming_cc != self.current_configuration_epoch() {
            self.copy_cc_to_pc();
            self.description.current_configuration_epoch = incoming_cc;
        }

        self.sender_node = Some(from);
        ctx.queue.send_to_proxy(ProxyMessage::ReplicatorGetStatus(
            self.replicas.local().replica_description(),
        ));
        self.complete(true)
    }

    pub fn process_deactivate(
        &mut self,
        from: NodeInstance,
        body: &DeactivateMessageBody,
        is_force: bool,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        if !self.is_local_replica_open() || self.replicas.local().is_in_create() {
            return self.drop_stale(ctx, "Deactivate");
        }

        let configuration = &body.configuration;
        let local_node = self.replicas.local_node_id();
        let Some(incoming) = configuration.find_replica(local_node).cloned() else {
            return Err(RaError::invalid_message(format!(
                "Deactivate for {} does not include node {}",
                self.failover_unit_id(),
                local_node
            )));
        };
        if self.replicas.local().instance_id > incoming.instance_id {
            return self.drop_stale(ctx, "Deactivate");
        }

        if is_force {
            let mode = if self.has_persisted_state() {
                ReplicaCloseMode::Restart
            } else {
                ReplicaCloseMode::Drop
            };
            let sender = (mode == ReplicaCloseMode::Drop).then_some(from);
            self.start_close_local_replica(mode, sender, ctx);
            return self.complete(true);
        }

        let incoming_cc = configuration.failover_unit.current_configuration_epoch;
        let is_duplicate_of_current = !self.previous_configuration_epoch().is_valid()
            && self.current_configuration_epoch() == incoming_cc
            && self.replicas.local().is_in_configuration();
        if is_duplicate_of_current || self.is_configuration_message_body_stale(configuration) {
            return self.drop_stale(ctx, "Deactivate");
        }

        self.update_deactivation_info(&configuration.failover_unit, &incoming, body.deactivation_info);

        let local = self.replicas.local();
        let update_state = (local.is_standby()
            || local.pc_role == ReplicaRole::None
            || self.intermediate_configuration_epoch < incoming_cc)
            && matches!(
                incoming.previous_role,
                ReplicaRole::Secondary | ReplicaRole::Primary
            );

        if update_state {
            self.intermediate_configuration_epoch = incoming_cc;
            self.refresh_configuration(configuration, false);
        }

        if incoming.current_role == ReplicaRole::None {
            self.start_close_local_replica(ReplicaCloseMode::Drop, Some(from), ctx);
            return self.complete(true);
        }

        if update_state && !incoming.is_in_current_configuration() {
            self.finish_deactivate();
        }

        self.send_reply(from, ReplyKind::Deactivate, ctx);
        self.complete(true)
    }

    /// Deactivated into an idle role: this replica is outside the
    /// configuration from now on.
    fn finish_deactivate(&mut self) {
        self.description.previous_configuration_epoch = Epoch::INVALID;
        self.intermediate_configuration_epoch = Epoch::INVALID;
        let local = self.replicas.local_mut();
        local.pc_role = ReplicaRole::None;
        local.ic_role = ReplicaRole::None;
        self.reconfiguration.reset();
        self.replicas.retain_remote(|r| !r.is_in_configuration());
    }

    pub fn process_activate(
        &mut self,
        from: NodeInstance,
        body: &ActivateMessageBody,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        if !self.is_local_replica_open() || self.is_local_replica_closing() {
            return self.drop_stale(ctx, "Activate");
        }

        let configuration = &body.configuration;
        let local_node = self.replicas.local_node_id();
        let Some(incoming) = configuration.find_replica(local_node).cloned() else {
            return Err(RaError::invalid_message(format!(
                "Activate for {} does not include node {}",
                self.failover_unit_id(),
                local_node
            )));
        };
        if incoming.current_role == ReplicaRole::Primary {
            return Err(RaError::invalid_message(format!(
                "Activate for {} names the receiving replica primary",
                self.failover_unit_id()
            )));
        }
        if self.replicas.local().instance_id > incoming.instance_id {
            return self.drop_stale(ctx, "Activate");
        }

        self.update_deactivation_info(&configuration.failover_unit, &incoming, body.deactivation_info);

        if self.replicas.local().message_stage == ReplicaMessageStage::RaProxyReplyPending {
            self.sender_node = Some(from);
            self.send_update_configuration(UpdateConfigurationMode::None, ctx);
            return self.complete(true);
        }

        let incoming_cc = configuration.failover_unit.current_configuration_epoch;
        let incoming_pc = configuration.failover_unit.previous_configuration_epoch;
        let local = self.replicas.local();
        let incoming_standby = incoming.state == ReplicaState::StandBy;

        let is_stale = (incoming_cc == self.current_configuration_epoch()
            && incoming_pc < self.previous_configuration_epoch()
            && incoming_standby
            && !local.is_standby())
            || self.is_configuration_message_body_stale(configuration);
        if is_stale {
            return self.drop_stale(ctx, "Activate");
        }

        let needs_update = local.is_standby()
            || incoming_cc > self.current_configuration_epoch()
            || (incoming.is_in_current_configuration()
                && (local.cc_role != incoming.current_role || local.pc_role != ReplicaRole::None));

        if needs_update {
            let previous_role = local.cc_role;
            self.refresh_configuration(configuration, true);
            self.intermediate_configuration_epoch = Epoch::INVALID;

            if !incoming_standby && previous_role != incoming.current_role {
                self.replicas.local_mut().message_stage = ReplicaMessageStage::RaProxyReplyPending;
                self.sender_node = Some(from);
                self.send_update_configuration(UpdateConfigurationMode::None, ctx);
                return self.complete(true);
            }

            self.finish_activate();
        }

        self.send_activate_reply(from, ctx);
        self.complete(true)
    }

    /// The new role has been applied locally.
    pub(super) fn finish_activate(&mut self) {
        self.replicas.local_mut().message_stage = ReplicaMessageStage::None;
        self.reset_reconfiguration_states();
        self.sender_node = None;
    }

    pub(super) fn send_activate_reply(&self, to: NodeInstance, ctx: &mut ExecutionContext<'_>) {
        self.send_reply(to, ReplyKind::Activate, ctx);
    }

    pub(super) fn send_deactivate_reply(&self, to: NodeInstance, ctx: &mut ExecutionContext<'_>) {
        self.send_reply(to, ReplyKind::Deactivate, ctx);
    }

    fn send_reply(&self, to: NodeInstance, kind: ReplyKind, ctx: &mut ExecutionContext<'_>) {
        let body = ReplicaReplyMessageBody {
            failover_unit: self.description,
            replica: self.replicas.local().replica_description(),
            error: ReplyError::Success,
        };
        let message = match kind {
            ReplyKind::Deactivate => RaMessage::DeactivateReply(body),
            ReplyKind::Activate => RaMessage::ActivateReply(body),
        };
        ctx.queue.send_to_ra(to, message);
    }
}

#[derive(Debug, Clone, Copy)]
enum ReplyKind {
    Deactivate,
    Activate,
}
