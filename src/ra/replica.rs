//! Mutable per-partition replica entry
//!
//! Owned by exactly one failover unit's `ReplicaStore`. Identity inside the
//! store is the node id; `(replica_id, instance_id)` tell incarnations apart.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::reliability::{
    NodeInstance, ReplicaDeactivationInfo, ReplicaDescription, ReplicaRole, ReplicaState,
    INVALID_LSN,
};

/// Lifecycle state tracked by the agent.
///
/// Finer grained than the wire `ReplicaState`: InCreate and InDrop are
/// transitional states local to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStates {
    InCreate,
    InBuild,
    StandBy,
    Ready,
    InDrop,
    Dropped,
}

impl ReplicaStates {
    pub fn from_wire(state: ReplicaState) -> Self {
        match state {
            ReplicaState::InBuild => ReplicaStates::InBuild,
            ReplicaState::Ready => ReplicaStates::Ready,
            ReplicaState::StandBy => ReplicaStates::StandBy,
            ReplicaState::Dropped => ReplicaStates::Dropped,
        }
    }

    pub fn to_wire(self) -> ReplicaState {
        match self {
            ReplicaStates::InCreate | ReplicaStates::InBuild => ReplicaState::InBuild,
            ReplicaStates::StandBy => ReplicaState::StandBy,
            ReplicaStates::Ready | ReplicaStates::InDrop => ReplicaState::Ready,
            ReplicaStates::Dropped => ReplicaState::Dropped,
        }
    }
}

/// Which peer the agent is waiting on for this replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaMessageStage {
    #[default]
    None,
    /// Waiting for the replica's node to reply
    RaReplyPending,
    /// Waiting for the local replicator / hosting proxy to reply
    RaProxyReplyPending,
}

/// Progress reported during GetLSN.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LsnProgress {
    #[default]
    NotSet,
    /// The replica replied but has no usable progress (never built)
    Unknown,
    Known { first: i64, last: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub node: NodeInstance,
    pub replica_id: i64,
    pub instance_id: i64,
    pub pc_role: ReplicaRole,
    pub ic_role: ReplicaRole,
    pub cc_role: ReplicaRole,
    pub state: ReplicaStates,
    pub is_up: bool,
    pub message_stage: ReplicaMessageStage,
    pub deactivation_info: ReplicaDeactivationInfo,
    pub to_be_deactivated: bool,
    pub to_be_activated: bool,
    pub to_be_restarted: bool,
    pub replicator_remove_pending: bool,
    progress: LsnProgress,
}

impl Replica {
    pub fn new(desc: &ReplicaDescription) -> Self {
        Self {
            node: desc.node,
            replica_id: desc.replica_id,
            instance_id: desc.instance_id,
            pc_role: desc.previous_role,
            ic_role: ReplicaRole::None,
            cc_role: desc.current_role,
            state: ReplicaStates::from_wire(desc.state),
            is_up: desc.is_up && desc.state != ReplicaState::Dropped,
            message_stage: ReplicaMessageStage::None,
            deactivation_info: ReplicaDeactivationInfo::dropped(),
            to_be_deactivated: false,
            to_be_activated: false,
            to_be_restarted: false,
            replicator_remove_pending: false,
            progress: LsnProgress::NotSet,
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node.id
    }

    pub fn is_in_previous_configuration(&self) -> bool {
        self.pc_role.is_in_configuration()
    }

    pub fn is_in_current_configuration(&self) -> bool {
        self.cc_role.is_in_configuration()
    }

    pub fn is_in_configuration(&self) -> bool {
        self.is_in_previous_configuration() || self.is_in_current_configuration()
    }

    pub fn is_ready(&self) -> bool {
        self.state == ReplicaStates::Ready
    }

    pub fn is_standby(&self) -> bool {
        self.state == ReplicaStates::StandBy
    }

    pub fn is_inbuild(&self) -> bool {
        self.state == ReplicaStates::InBuild
    }

    pub fn is_in_create(&self) -> bool {
        self.state == ReplicaStates::InCreate
    }

    pub fn is_in_drop(&self) -> bool {
        self.state == ReplicaStates::InDrop
    }

    pub fn is_dropped(&self) -> bool {
        self.state == ReplicaStates::Dropped
    }

    /// Created remotely but not yet caught up by the primary.
    pub fn is_build_in_progress(&self) -> bool {
        self.is_in_create()
            || (self.is_inbuild() && !self.to_be_activated && !self.to_be_deactivated)
    }

    /// Up and ready: counts as a live member of a configuration.
    pub fn is_available(&self) -> bool {
        self.is_up && self.is_ready()
    }

    pub fn progress(&self) -> LsnProgress {
        self.progress
    }

    pub fn is_lsn_set(&self) -> bool {
        self.progress != LsnProgress::NotSet
    }

    pub fn is_lsn_unknown(&self) -> bool {
        self.progress == LsnProgress::Unknown
    }

    pub fn first_acknowledged_lsn(&self) -> i64 {
        match self.progress {
            LsnProgress::Known { first, .. } => first,
            _ => INVALID_LSN,
        }
    }

    pub fn last_acknowledged_lsn(&self) -> i64 {
        match self.progress {
            LsnProgress::Known { last, .. } => last,
            _ => INVALID_LSN,
        }
    }

    /// Record GetLSN progress together with the replica's deactivation info.
    pub fn set_progress(&mut self, desc: &ReplicaDescription, info: ReplicaDeactivationInfo) {
        self.progress = if desc.last_acknowledged_lsn == INVALID_LSN {
            LsnProgress::Unknown
        } else {
            LsnProgress::Known {
                first: desc.first_acknowledged_lsn,
                last: desc.last_acknowledged_lsn,
            }
        };
        self.deactivation_info = info;
    }

    /// Adopt progress carried in a message, if it carries any.
    pub fn try_set_progress(&mut self, desc: &ReplicaDescription) {
        if desc.last_acknowledged_lsn != INVALID_LSN {
            self.progress = LsnProgress::Known {
                first: desc.first_acknowledged_lsn,
                last: desc.last_acknowledged_lsn,
            };
        }
    }

    pub fn set_lsn_unknown(&mut self) {
        self.progress = LsnProgress::Unknown;
    }

    pub fn clear_lsn(&mut self) {
        self.progress = LsnProgress::NotSet;
    }

    pub fn try_clear_unknown_lsn(&mut self) {
        if self.is_lsn_unknown() {
            self.progress = LsnProgress::NotSet;
        }
    }

    /// Marking an already-down replica down again changes nothing.
    pub fn mark_down(&mut self) {
        if !self.is_up {
            return;
        }
        self.is_up = false;
        self.message_stage = ReplicaMessageStage::None;
    }

    pub fn mark_as_dropped(&mut self) {
        self.state = ReplicaStates::Dropped;
        self.is_up = false;
        self.message_stage = ReplicaMessageStage::None;
        self.to_be_activated = false;
        self.to_be_deactivated = false;
        self.to_be_restarted = false;
        self.progress = LsnProgress::NotSet;
    }

    /// Adopt a newer incarnation of this replica. It starts as StandBy until
    /// the primary builds it.
    pub fn update_instance(&mut self, desc: &ReplicaDescription) {
        self.node = desc.node;
        self.replica_id = desc.replica_id;
        self.instance_id = desc.instance_id;
        self.is_up = desc.is_up;
        self.state = ReplicaStates::StandBy;
        self.message_stage = ReplicaMessageStage::None;
        self.to_be_restarted = false;
        self.replicator_remove_pending = false;
        self.progress = LsnProgress::NotSet;
    }

    pub fn clear_configuration_flags(&mut self) {
        self.to_be_activated = false;
        self.to_be_deactivated = false;
        self.to_be_restarted = false;
    }

    /// Wire snapshot using PC and CC roles.
    pub fn replica_description(&self) -> ReplicaDescription {
        self.description_with_roles(self.pc_role, self.cc_role)
    }

    /// Description sent in Deactivate/Activate. A built replica that only
    /// waits for the epoch update is sent to its own node as Ready.
    pub fn description_for_deactivate_or_activate(&self, is_target: bool) -> ReplicaDescription {
        let mut desc = self.replica_description();
        if is_target && self.is_inbuild() && (self.to_be_activated || self.to_be_deactivated) {
            desc.state = ReplicaState::Ready;
        }
        desc
    }

    pub fn description_with_roles(
        &self,
        previous: ReplicaRole,
        current: ReplicaRole,
    ) -> ReplicaDescription {
        ReplicaDescription {
            node: self.node,
            replica_id: self.replica_id,
            instance_id: self.instance_id,
            previous_role: previous,
            current_role: current,
            state: self.state.to_wire(),
            is_up: self.is_up,
            first_acknowledged_lsn: self.first_acknowledged_lsn(),
            last_acknowledged_lsn: self.last_acknowledged_lsn(),
        }
    }
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {}:{} {}/{}/{} {:?} {} {:?}]",
            self.node,
            self.replica_id,
            self.instance_id,
            self.pc_role.code(),
            self.ic_role.code(),
            self.cc_role.code(),
            self.state,
            if self.is_up { "U" } else { "D" },
            self.message_stage
        )
    }
}
