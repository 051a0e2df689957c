//! Message bodies exchanged by the reconfiguration protocol
//!
//! These carry fields only. Encoding is left to the transport; every body
//! derives serde so a transport can pick its own format.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::deactivation::ReplicaDeactivationInfo;
use super::epoch::Epoch;
use super::failover_unit_description::{FailoverUnitDescription, ServiceDescription};
use super::replica_description::{ReplicaDescription, ReplicaRole};

/// Outcome carried by a reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyError {
    #[default]
    Success,
    NotFound,
    StateChangedOnDataLoss,
    DemoteCompleted,
    Failed,
}

impl ReplyError {
    pub fn is_success(&self) -> bool {
        *self == ReplyError::Success
    }
}

fn find<'a>(replicas: &'a [ReplicaDescription], node_id: u64) -> Option<&'a ReplicaDescription> {
    replicas.iter().find(|r| r.node.id == node_id)
}

/// FM instruction to start or continue a reconfiguration.
///
/// The new primary is the replica whose current role is Primary.
/// `phase0_duration` is set when the FM asks for a swap primary that first
/// demotes the existing primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoReconfigurationMessageBody {
    pub failover_unit: FailoverUnitDescription,
    pub service: ServiceDescription,
    pub replicas: Vec<ReplicaDescription>,
    #[serde(default)]
    pub phase0_duration: Option<Duration>,
}

impl DoReconfigurationMessageBody {
    pub fn primary(&self) -> Option<&ReplicaDescription> {
        self.replicas
            .iter()
            .find(|r| r.current_role == ReplicaRole::Primary)
    }

    pub fn find_replica(&self, node_id: u64) -> Option<&ReplicaDescription> {
        find(&self.replicas, node_id)
    }
}

/// Single replica addressed by a message (GetLSN, CreateReplica, drops).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMessageBody {
    pub failover_unit: FailoverUnitDescription,
    pub service: ServiceDescription,
    pub replica: ReplicaDescription,
}

/// Reply to a replica-level request from the replica's node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaReplyMessageBody {
    pub failover_unit: FailoverUnitDescription,
    pub replica: ReplicaDescription,
    pub error: ReplyError,
}

/// GetLSN reply. Carries the replica's progress and deactivation info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLsnReplyMessageBody {
    pub failover_unit: FailoverUnitDescription,
    pub replica: ReplicaDescription,
    pub deactivation_info: ReplicaDeactivationInfo,
    pub error: ReplyError,
}

/// A full configuration view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationMessageBody {
    pub failover_unit: FailoverUnitDescription,
    pub service: ServiceDescription,
    pub replicas: Vec<ReplicaDescription>,
}

impl ConfigurationMessageBody {
    pub fn find_replica(&self, node_id: u64) -> Option<&ReplicaDescription> {
        find(&self.replicas, node_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateMessageBody {
    pub configuration: ConfigurationMessageBody,
    pub deactivation_info: ReplicaDeactivationInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateMessageBody {
    pub configuration: ConfigurationMessageBody,
    pub deactivation_info: ReplicaDeactivationInfo,
}

/// A replica in a node self-report, with its intermediate configuration role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub description: ReplicaDescription,
    pub intermediate_role: ReplicaRole,
}

impl ReplicaInfo {
    pub fn new(description: ReplicaDescription, intermediate_role: ReplicaRole) -> Self {
        Self {
            description,
            intermediate_role,
        }
    }
}

/// A node's self-reported view of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnitInfo {
    pub service: ServiceDescription,
    pub failover_unit: FailoverUnitDescription,
    pub intermediate_configuration_epoch: Epoch,
    pub is_report_from_primary: bool,
    pub replicas: Vec<ReplicaInfo>,
}

impl FailoverUnitInfo {
    pub fn pc_epoch(&self) -> Epoch {
        self.failover_unit.previous_configuration_epoch
    }

    pub fn cc_epoch(&self) -> Epoch {
        self.failover_unit.current_configuration_epoch
    }

    pub fn ic_epoch(&self) -> Epoch {
        self.intermediate_configuration_epoch
    }

    pub fn find_replica(&self, node_id: u64) -> Option<&ReplicaInfo> {
        self.replicas.iter().find(|r| r.description.node.id == node_id)
    }

    /// The replica this report names as current primary, if any.
    pub fn current_primary(&self) -> Option<&ReplicaInfo> {
        self.replicas
            .iter()
            .find(|r| r.description.current_role == ReplicaRole::Primary)
    }
}
