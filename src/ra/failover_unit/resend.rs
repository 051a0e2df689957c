//! Retry timer driven resends
//!
//! Messages are never tracked individually. Whatever a replica's message
//! stage says is still outstanding is sent again on every timer tick, and
//! the timer stays armed only while something was sent.

use crate::observability::{log_event_with_fields, Event};
use crate::reliability::{
    ActivateMessageBody, DeactivateMessageBody, ReplicaDeactivationInfo, ReplicaRole,
};

use super::super::action_queue::{FmMessage, ProxyMessage, RaMessage, UpdateConfigurationMode};
use super::super::context::ExecutionContext;
use super::super::errors::RaResult;
use super::super::reconfiguration_state::ReconfigurationStage;
use super::super::replica::{Replica, ReplicaMessageStage};
use super::{FailoverUnit, LocalReplicaLifecycle, ReplicaOpenMode};

impl FailoverUnit {
    /// Retry timer fired. Re-evaluates progress, since waits such as the
    /// minimum GetLSN wait only expire with time, then resends.
    pub fn on_timer(&mut self, ctx: &mut ExecutionContext<'_>) -> RaResult<bool> {
        self.ensure_open()?;

        if !self.message_retry_active {
            return Ok(false);
        }

        let stage = self.reconfiguration.stage();
        if self.reconfiguration.is_reconfiguring() {
            self.check_reconfiguration_progress_and_health(ctx);
        }

        if self.reconfiguration.stage() == stage {
            let sent = self.process_msg_resends(ctx);
            if sent > 0 {
                ctx.metrics.add_message_resends(sent as u64);
                log_event_with_fields(
                    Event::MessageResend,
                    &[
                        ("failover_unit", &self.failover_unit_id().to_string()),
                        ("stage", stage.as_str()),
                        ("count", &sent.to_string()),
                    ],
                );
            }
        }

        self.complete(true)
    }

    /// Send everything still outstanding for the current stage. Returns how
    /// many replicas and stage level requests had something resent.
    pub(super) fn process_msg_resends(&mut self, ctx: &mut ExecutionContext<'_>) -> usize {
        let stage = self.reconfiguration.stage();
        let mut sent = 0;

        if self.send_local_lifecycle_request(ctx) {
            sent += 1;
        }

        for replica in self.replicas.iter() {
            let replica_sent = match stage {
                ReconfigurationStage::Phase1GetLsn => self.send_get_lsn(replica, ctx),
                ReconfigurationStage::Phase0Demote | ReconfigurationStage::Phase2Catchup => {
                    self.send_lifecycle_message(replica, ctx)
                        | self.send_update_deactivation_info(replica, ctx)
                        | self.send_restart(replica, ctx)
                }
                ReconfigurationStage::Phase3Deactivate => {
                    self.send_lifecycle_message(replica, ctx)
                        | self.send_deactivate(replica, ctx)
                        | self.send_restart(replica, ctx)
                }
                ReconfigurationStage::Phase4Activate => {
                    self.send_lifecycle_message(replica, ctx)
                        | self.send_activate(replica, ctx)
                        | self.send_restart(replica, ctx)
                }
                ReconfigurationStage::None => {
                    self.send_lifecycle_message(replica, ctx) | self.send_activate(replica, ctx)
                }
                ReconfigurationStage::AbortPhase0Demote => false,
            };
            if replica_sent {
                sent += 1;
            }
        }

        let stage_sent = match stage {
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::Phase2Catchup => {
                self.send_update_configuration(UpdateConfigurationMode::Catchup, ctx);
                true
            }
            ReconfigurationStage::None | ReconfigurationStage::Phase3Deactivate => {
                let activation_pending = self.sender_node.is_some()
                    && self.replicas.local().message_stage
                        == ReplicaMessageStage::RaProxyReplyPending;
                if (self.update_replicator_configuration && self.is_local_primary())
                    || activation_pending
                {
                    self.send_update_configuration(UpdateConfigurationMode::None, ctx);
                    true
                } else {
                    false
                }
            }
            ReconfigurationStage::Phase4Activate => self.send_end_reconfiguration(ctx),
            ReconfigurationStage::AbortPhase0Demote => {
                ctx.queue.send_to_proxy(ProxyMessage::CancelCatchup(
                    self.replicas.local().replica_description(),
                ));
                true
            }
            ReconfigurationStage::Phase1GetLsn => self.send_data_loss_report(ctx),
        };
        if stage_sent {
            sent += 1;
        }

        self.set_message_retry_active(sent > 0, ctx);
        sent
    }

    pub(super) fn send_get_lsn(&self, replica: &Replica, ctx: &mut ExecutionContext<'_>) -> bool {
        if self.replicas.is_local(replica.node.id) {
            if replica.message_stage != ReplicaMessageStage::RaProxyReplyPending {
                return false;
            }
            ctx.queue.send_to_proxy(ProxyMessage::ReplicatorGetStatus(
                replica.replica_description(),
            ));
            return true;
        }

        if replica.message_stage != ReplicaMessageStage::RaReplyPending || !replica.is_up {
            return false;
        }
        ctx.queue
            .send_to_ra(replica.node, RaMessage::GetLsn(self.replica_message_body(replica)));
        true
    }

    /// An open or close of the local replica that has not succeeded yet.
    fn send_local_lifecycle_request(&self, ctx: &mut ExecutionContext<'_>) -> bool {
        let replica = self.replicas.local().replica_description();
        match self.lifecycle {
            LocalReplicaLifecycle::Opening(mode) => {
                ctx.queue.send_to_proxy(ProxyMessage::ReplicaOpen {
                    replica,
                    reopen: mode == ReplicaOpenMode::Reopen,
                });
                true
            }
            LocalReplicaLifecycle::Closing { mode, .. } => {
                ctx.queue
                    .send_to_proxy(ProxyMessage::ReplicaClose { replica, mode });
                true
            }
            LocalReplicaLifecycle::Open | LocalReplicaLifecycle::Down => false,
        }
    }

    /// Resend the data loss report until FM answers with a newer data loss
    /// version.
    pub(super) fn send_data_loss_report(&self, ctx: &mut ExecutionContext<'_>) -> bool {
        let Some(reported) = self.data_loss_version_to_report else {
            return false;
        };
        if self.current_configuration_epoch().data_loss_version > reported {
            return false;
        }

        ctx.queue
            .send_to_fm(FmMessage::DataLossReport(self.configuration_body()));
        true
    }

    /// Create, build or remove a replica on behalf of the primary.
    fn send_lifecycle_message(&self, replica: &Replica, ctx: &mut ExecutionContext<'_>) -> bool {
        let local = self.replicas.local();
        let is_acting_primary = local.cc_role == ReplicaRole::Primary
            || (local.pc_role == ReplicaRole::Primary && local.cc_role == ReplicaRole::Secondary);

        if !is_acting_primary
            || self.replicas.is_local(replica.node.id)
            || replica.cc_role == ReplicaRole::Primary
            || !(replica.is_in_configuration() || replica.cc_role == ReplicaRole::Idle)
        {
            return false;
        }

        if replica.is_up && replica.is_in_create() {
            ctx.queue.send_to_ra(
                replica.node,
                RaMessage::CreateReplica(self.replica_message_body(replica)),
            );
            true
        } else if replica.is_up
            && replica.is_inbuild()
            && !replica.to_be_activated
            && !replica.to_be_deactivated
        {
            ctx.queue
                .send_to_proxy(ProxyMessage::BuildIdleReplica(replica.replica_description()));
            true
        } else if !replica.is_up && replica.replicator_remove_pending {
            ctx.queue
                .send_to_proxy(ProxyMessage::RemoveIdleReplica(replica.replica_description()));
            true
        } else if replica.is_in_drop() {
            ctx.queue
                .send_to_proxy(ProxyMessage::RemoveIdleReplica(replica.replica_description()));
            true
        } else {
            false
        }
    }

    /// A replica built during catchup learns the new deactivation info.
    fn send_update_deactivation_info(
        &self,
        replica: &Replica,
        ctx: &mut ExecutionContext<'_>,
    ) -> bool {
        if self.replicas.is_local(replica.node.id)
            || !replica.is_up
            || !replica.is_inbuild()
            || !replica.to_be_deactivated
        {
            return false;
        }

        self.send_deactivate_message(replica, self.deactivation_info, false, ctx);
        true
    }

    /// Ask a replica that cannot be caught up to restart.
    fn send_restart(&self, replica: &Replica, ctx: &mut ExecutionContext<'_>) -> bool {
        if self.replicas.is_local(replica.node.id) || !replica.is_up || !replica.to_be_restarted {
            return false;
        }

        self.send_deactivate_message(replica, ReplicaDeactivationInfo::dropped(), true, ctx);
        true
    }

    pub(super) fn send_deactivate(&self, replica: &Replica, ctx: &mut ExecutionContext<'_>) -> bool {
        if self.replicas.is_local(replica.node.id)
            || replica.message_stage != ReplicaMessageStage::RaReplyPending
            || !replica.is_up
            || replica.is_in_create()
            || (replica.is_inbuild() && !replica.to_be_deactivated)
            || replica.to_be_restarted
        {
            return false;
        }

        self.send_deactivate_message(replica, self.deactivation_info, false, ctx);
        true
    }

    pub(super) fn send_activate(&self, replica: &Replica, ctx: &mut ExecutionContext<'_>) -> bool {
        if self.replicas.is_local(replica.node.id)
            || replica.message_stage != ReplicaMessageStage::RaReplyPending
            || !replica.is_up
            || !replica.is_in_current_configuration()
            || replica.is_in_create()
            || (replica.is_inbuild() && !replica.to_be_activated)
            || replica.to_be_restarted
        {
            return false;
        }

        ctx.queue.send_to_ra(
            replica.node,
            RaMessage::Activate(ActivateMessageBody {
                configuration: self.configuration_body_for(replica.node.id),
                deactivation_info: self.deactivation_info,
            }),
        );
        true
    }

    fn send_deactivate_message(
        &self,
        replica: &Replica,
        deactivation_info: ReplicaDeactivationInfo,
        is_force: bool,
        ctx: &mut ExecutionContext<'_>,
    ) {
        ctx.queue.send_to_ra(
            replica.node,
            RaMessage::Deactivate {
                body: DeactivateMessageBody {
                    configuration: self.configuration_body_for(replica.node.id),
                    deactivation_info,
                },
                is_force,
            },
        );
    }
}
