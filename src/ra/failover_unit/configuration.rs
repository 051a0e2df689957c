//! Self report and configuration rewrites

use crate::reliability::{
    ConfigurationMessageBody, Epoch, FailoverUnitDescription, FailoverUnitInfo,
    ReplicaDeactivationInfo, ReplicaDescription, ReplicaInfo, ReplicaRole, ReplicaState,
    INVALID_LSN,
};

use super::super::replica::{Replica, ReplicaMessageStage, ReplicaStates};
use super::FailoverUnit;

impl FailoverUnit {
    /// The report this node sends to FM during rebuild.
    ///
    /// A closed or dropping local replica reports only itself, dropped.
    pub fn try_get_configuration(&self) -> FailoverUnitInfo {
        let local = self.replicas.local();

        if self.is_closed() || local.is_in_drop() {
            let mut desc = local.replica_description();
            desc.state = ReplicaState::Dropped;
            desc.is_up = false;
            return FailoverUnitInfo {
                service: self.service.clone(),
                failover_unit: self.description,
                intermediate_configuration_epoch: Epoch::INVALID,
                is_report_from_primary: false,
                replicas: vec![ReplicaInfo::new(desc, ReplicaRole::None)],
            };
        }

        let is_report_from_primary = self.is_primary_report();

        let replicas = self
            .replicas
            .iter()
            .map(|r| {
                let mut desc = r.replica_description();
                if self.replicas.is_local(r.node.id) {
                    if is_report_from_primary && r.is_standby() {
                        desc.state = ReplicaState::InBuild;
                    } else if !is_report_from_primary
                        && (r.pc_role == ReplicaRole::Primary || r.ic_role == ReplicaRole::Primary)
                        && r.is_ready()
                    {
                        // A primary that has not finished reconfiguring is not
                        // a ready replica from the report's point of view
                        desc.state = ReplicaState::InBuild;
                    }
                }
                ReplicaInfo::new(desc, r.ic_role)
            })
            .collect();

        FailoverUnitInfo {
            service: self.service.clone(),
            failover_unit: self.description,
            intermediate_configuration_epoch: self.intermediate_configuration_epoch,
            is_report_from_primary,
            replicas,
        }
    }

    fn is_primary_report(&self) -> bool {
        let local = self.replicas.local();
        if !local.is_up {
            return false;
        }

        if !(local.is_available() || local.is_in_create() || local.is_standby()) {
            return false;
        }

        if local.pc_role != ReplicaRole::Primary && local.cc_role != ReplicaRole::Primary {
            return false;
        }

        self.reconfiguration.is_reconfiguring()
            || (local.cc_role == ReplicaRole::Primary && !local.is_standby())
    }

    /// Snapshot CC as PC when no reconfiguration has recorded a PC yet.
    pub(super) fn copy_cc_to_pc(&mut self) {
        if self.previous_configuration_epoch().is_valid()
            || !self.replicas.local().is_in_current_configuration()
        {
            return;
        }

        self.description.previous_configuration_epoch = self.current_configuration_epoch();
        for replica in self.replicas.iter_mut().filter(|r| r.is_in_configuration()) {
            replica.pc_role = replica.cc_role;
        }
    }

    /// Clear reconfiguration bookkeeping once a reconfiguration is over.
    /// Replicas outside CC are forgotten, except up ready idle replicas.
    pub(super) fn reset_reconfiguration_states(&mut self) {
        self.description.previous_configuration_epoch = Epoch::INVALID;
        self.intermediate_configuration_epoch = Epoch::INVALID;

        for replica in self.replicas.iter_mut().filter(|r| r.is_in_configuration()) {
            replica.pc_role = ReplicaRole::None;
            replica.ic_role = ReplicaRole::None;
            replica.clear_lsn();
            replica.message_stage = ReplicaMessageStage::None;
        }

        self.replicas.retain_remote(|r| {
            r.is_in_current_configuration()
                || (r.cc_role == ReplicaRole::Idle && r.is_ready() && r.is_up)
        });
    }

    /// Undo the role changes of a reconfiguration that was handed back to
    /// FM or aborted.
    pub(super) fn revert_configuration(&mut self) {
        let local = self.replicas.local_node_id();
        let mut to_remove = Vec::new();

        for replica in self.replicas.iter_mut().filter(|r| r.is_in_configuration()) {
            replica.cc_role = replica.pc_role;
            replica.clear_lsn();
            replica.message_stage = ReplicaMessageStage::None;

            if replica.node.id != local && replica.pc_role == ReplicaRole::Idle {
                to_remove.push(replica.node.id);
            }
        }

        for node_id in to_remove {
            self.replicas.remove(node_id);
        }
    }

    /// Adopt the configuration carried by a Deactivate or Activate.
    pub(super) fn refresh_configuration(&mut self, body: &ConfigurationMessageBody, reset_ic: bool) {
        let use_cc_as_pc = !body.failover_unit.previous_configuration_epoch.is_valid();

        self.replicas.retain_remote(|r| !r.is_in_configuration());
        self.description.previous_configuration_epoch = if use_cc_as_pc {
            body.failover_unit.current_configuration_epoch
        } else {
            body.failover_unit.previous_configuration_epoch
        };
        self.description.current_configuration_epoch = body.failover_unit.current_configuration_epoch;

        for desc in &body.replicas {
            if self.replicas.get(desc.node.id).is_some() {
                continue;
            }

            if !desc.is_in_previous_configuration() && !desc.is_in_current_configuration() {
                continue;
            }

            let pc_role = if use_cc_as_pc {
                desc.current_role
            } else {
                desc.previous_role
            };

            let replica = self.replicas.add_remote(Replica::new(desc));
            replica.pc_role = pc_role;
            replica.cc_role = desc.current_role;
            replica.ic_role = if reset_ic {
                ReplicaRole::None
            } else {
                desc.current_role
            };
            replica.is_up = desc.is_up;
        }

        let local_node = self.replicas.local_node_id();
        let Some(incoming) = body.find_replica(local_node) else {
            return;
        };

        let local = self.replicas.local_mut();
        local.pc_role = if use_cc_as_pc {
            incoming.current_role
        } else {
            incoming.previous_role
        };
        local.state = ReplicaStates::from_wire(incoming.state);
        local.ic_role = if reset_ic {
            ReplicaRole::None
        } else {
            incoming.current_role
        };

        // S/N/I and P/N/I replicas deactivated into [S/S] stay S/S/I so that
        // Activate still sees a role change
        if !(local.cc_role == ReplicaRole::Idle && local.is_in_previous_configuration() && !reset_ic) {
            local.cc_role = incoming.current_role;
        }
    }

    /// A message is stale if it names an older instance of a replica this
    /// unit already knows.
    pub(super) fn is_configuration_message_body_stale(&self, body: &ConfigurationMessageBody) -> bool {
        body.replicas.iter().any(|incoming| {
            self.replicas
                .get(incoming.node.id)
                .map(|r| r.replica_id == incoming.replica_id && r.instance_id > incoming.instance_id)
                .unwrap_or(false)
        })
    }

    /// Move the local deactivation info forward. It never goes back.
    pub(super) fn update_deactivation_info(
        &mut self,
        failover_unit: &FailoverUnitDescription,
        incoming_replica: &ReplicaDescription,
        incoming: ReplicaDeactivationInfo,
    ) {
        if !incoming_replica.is_ready() {
            return;
        }

        let info = if incoming.is_valid() {
            incoming
        } else if incoming_replica.last_acknowledged_lsn == INVALID_LSN {
            ReplicaDeactivationInfo::dropped()
        } else {
            ReplicaDeactivationInfo::new(
                failover_unit.current_configuration_epoch,
                incoming_replica.last_acknowledged_lsn,
            )
        };

        if info <= self.deactivation_info {
            return;
        }

        self.deactivation_info = info;
    }
}
