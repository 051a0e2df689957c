//! Idle replica build and removal on the primary
//!
//! FM adds a replica as Idle (or directly as Secondary). The primary creates
//! it on the remote node, has the replicator build it and then either marks
//! it ready or folds it into the running reconfiguration.

use crate::observability::{log_event_with_fields, Event};
use crate::reliability::{ReplicaMessageBody, ReplicaReplyMessageBody, ReplicaRole, ReplyError};

use super::super::action_queue::{FmMessage, ProxyMessage, RaMessage};
use super::super::context::ExecutionContext;
use super::super::errors::{RaError, RaResult};
use super::super::reconfiguration_state::ReconfigurationStage;
use super::super::replica::{Replica, ReplicaMessageStage, ReplicaStates};
use super::FailoverUnit;

impl FailoverUnit {
    /// FM asks the primary to add a replica for build.
    pub fn start_add_replica_for_build(
        &mut self,
        body: &ReplicaMessageBody,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        let desc = &body.replica;
        if !matches!(desc.current_role, ReplicaRole::Idle | ReplicaRole::Secondary) {
            return Err(RaError::invalid_message(format!(
                "replica on node {} cannot be added as {:?}",
                desc.node.id, desc.current_role
            )));
        }

        if !self.is_local_primary()
            || !self.is_local_replica_open()
            || self.replicas.is_local(desc.node.id)
            || body.failover_unit.current_configuration_epoch != self.current_configuration_epoch()
        {
            return self.drop_stale(ctx, "AddReplica");
        }

        if let Some(existing) = self.replicas.get(desc.node.id) {
            if existing.instance_id >= desc.instance_id {
                return self.drop_stale(ctx, "AddReplica");
            }
            self.replicas.remove(desc.node.id);
        }

        let replica = self.replicas.add_remote(Replica::new(desc));
        replica.pc_role = ReplicaRole::None;
        replica.cc_role = desc.current_role;
        replica.state = ReplicaStates::InCreate;
        replica.is_up = true;

        log_event_with_fields(
            Event::IdleReplicaAdded,
            &[
                ("failover_unit", &self.failover_unit_id().to_string()),
                ("node", &desc.node.id.to_string()),
                ("role", &format!("{:?}", desc.current_role)),
            ],
        );

        if let Some(replica) = self.replicas.get(desc.node.id) {
            ctx.queue.send_to_ra(
                replica.node,
                RaMessage::CreateReplica(self.replica_message_body(replica)),
            );
        }
        self.set_message_retry_active(true, ctx);
        self.complete(true)
    }

    /// The remote node created the replica; the replicator can build it now.
    pub fn process_create_replica_reply(
        &mut self,
        body: &ReplicaReplyMessageBody,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        let node = body.replica.node.id;
        let matches = self
            .replicas
            .get(node)
            .map(|r| r.instance_id == body.replica.instance_id && r.is_in_create())
            .unwrap_or(false);
        if !matches {
            return self.drop_stale(ctx, "CreateReplicaReply");
        }

        if !body.error.is_success() {
            return self.abort_add_idle_replica(node, body.error, ctx);
        }

        let Some(replica) = self.replicas.get_mut(node) else {
            return self.drop_stale(ctx, "CreateReplicaReply");
        };
        replica.state = ReplicaStates::InBuild;
        let desc = replica.replica_description();

        ctx.queue.send_to_proxy(ProxyMessage::BuildIdleReplica(desc));
        self.complete(true)
    }

    fn abort_add_idle_replica(
        &mut self,
        node: u64,
        error: ReplyError,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        let Some(replica) = self.replicas.remove(node) else {
            return self.drop_stale(ctx, "CreateReplicaReply");
        };

        ctx.queue.send_to_fm(FmMessage::AddReplicaReply(ReplicaReplyMessageBody {
            failover_unit: self.description,
            replica: replica.replica_description(),
            error,
        }));
        self.complete(true)
    }

    /// The replicator finished building a replica.
    ///
    /// An idle replica becomes ready. A secondary still has to learn the
    /// current epoch: through Deactivate while catching up, otherwise
    /// through Activate.
    pub fn process_build_idle_replica_reply(
        &mut self,
        body: &ReplicaReplyMessageBody,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        let node = body.replica.node.id;
        let stage = self.reconfiguration.stage();

        let Some(replica) = self.replicas.get_mut(node) else {
            return self.drop_stale(ctx, "BuildIdleReplicaReply");
        };
        if replica.instance_id != body.replica.instance_id
            || !replica.is_up
            || !replica.is_inbuild()
            || replica.to_be_activated
            || replica.to_be_deactivated
        {
            return self.drop_stale(ctx, "BuildIdleReplicaReply");
        }

        if !body.error.is_success() {
            // Retried from the resend path while the replica stays InBuild
            return self.complete(false);
        }

        if replica.cc_role == ReplicaRole::Idle {
            replica.state = ReplicaStates::Ready;
            if replica.pc_role == ReplicaRole::None {
                let desc = replica.replica_description();
                ctx.queue.send_to_fm(FmMessage::AddReplicaReply(ReplicaReplyMessageBody {
                    failover_unit: self.description,
                    replica: desc,
                    error: ReplyError::Success,
                }));
            }
            return self.complete(true);
        }

        match stage {
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::Phase2Catchup => {
                replica.to_be_deactivated = true;
            }
            ReconfigurationStage::Phase3Deactivate => {
                replica.to_be_deactivated = true;
                replica.message_stage = ReplicaMessageStage::RaReplyPending;
            }
            ReconfigurationStage::Phase4Activate | ReconfigurationStage::None => {
                replica.to_be_activated = true;
                replica.message_stage = ReplicaMessageStage::RaReplyPending;
            }
            ReconfigurationStage::Phase1GetLsn | ReconfigurationStage::AbortPhase0Demote => {
                return self.complete(true);
            }
        }

        self.process_msg_resends(ctx);
        self.complete(true)
    }

    /// FM asks the primary to remove an idle replica.
    pub fn start_remove_idle_replica(
        &mut self,
        body: &ReplicaMessageBody,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        let node = body.replica.node.id;
        if !self.is_local_primary() || self.replicas.is_local(node) {
            return self.drop_stale(ctx, "RemoveReplica");
        }

        let Some(replica) = self.replicas.get_mut(node) else {
            // Already gone
            ctx.queue.send_to_fm(FmMessage::RemoveReplicaReply(ReplicaReplyMessageBody {
                failover_unit: self.description,
                replica: body.replica.clone(),
                error: ReplyError::Success,
            }));
            return self.complete(true);
        };
        if replica.instance_id != body.replica.instance_id
            || replica.cc_role != ReplicaRole::Idle
            || replica.is_in_previous_configuration()
        {
            return self.drop_stale(ctx, "RemoveReplica");
        }

        replica.state = ReplicaStates::InDrop;
        replica.to_be_activated = false;
        replica.to_be_deactivated = false;
        let desc = replica.replica_description();

        ctx.queue.send_to_proxy(ProxyMessage::RemoveIdleReplica(desc));
        self.set_message_retry_active(true, ctx);
        self.complete(true)
    }

    /// The replicator let go of a replica: either an idle replica FM asked
    /// to remove, or one that went down while it was being built.
    pub fn process_remove_idle_replica_reply(
        &mut self,
        body: &ReplicaReplyMessageBody,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        let node = body.replica.node.id;
        let Some(replica) = self.replicas.get_mut(node) else {
            return self.drop_stale(ctx, "RemoveIdleReplicaReply");
        };
        if replica.instance_id != body.replica.instance_id || !body.error.is_success() {
            return self.drop_stale(ctx, "RemoveIdleReplicaReply");
        }

        if replica.is_in_drop() {
            if let Some(removed) = self.replicas.remove(node) {
                log_event_with_fields(
                    Event::IdleReplicaRemoved,
                    &[
                        ("failover_unit", &self.failover_unit_id().to_string()),
                        ("node", &node.to_string()),
                    ],
                );
                ctx.queue.send_to_fm(FmMessage::RemoveReplicaReply(ReplicaReplyMessageBody {
                    failover_unit: self.description,
                    replica: removed.replica_description(),
                    error: ReplyError::Success,
                }));
            }
            return self.complete(true);
        }

        if !replica.replicator_remove_pending {
            return self.drop_stale(ctx, "RemoveIdleReplicaReply");
        }

        replica.replicator_remove_pending = false;
        self.mark_replication_configuration_update_pending();
        if self.reconfiguration.is_reconfiguring() {
            self.check_reconfiguration_progress_and_health(ctx);
        }
        self.complete(true)
    }
}
