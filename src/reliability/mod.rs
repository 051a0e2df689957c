//! Shared reliability data model
//!
//! Value types used by both the reconfiguration agent (`ra`) and the
//! failover manager rebuild path (`fm`):
//! - `Epoch`: configuration generation
//! - `ReplicaDescription`: replica snapshot
//! - `ReplicaDeactivationInfo`: catchup boundary
//! - message bodies and the `FailoverUnitInfo` node report

mod deactivation;
mod epoch;
mod failover_unit_description;
mod messages;
mod replica_description;

pub use deactivation::ReplicaDeactivationInfo;
pub use epoch::Epoch;
pub use failover_unit_description::{
    ConsistencyUnitDescription, FailoverUnitDescription, ServiceDescription,
};
pub use messages::{
    ActivateMessageBody, ConfigurationMessageBody, DeactivateMessageBody,
    DoReconfigurationMessageBody, FailoverUnitInfo, GetLsnReplyMessageBody, ReplicaInfo,
    ReplicaMessageBody, ReplicaReplyMessageBody, ReplyError,
};
pub use replica_description::{
    NodeInstance, ReplicaDescription, ReplicaRole, ReplicaState, INVALID_LSN,
};
