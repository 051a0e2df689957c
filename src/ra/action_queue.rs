//! Deferred side effects
//!
//! State transitions never perform I/O. Every message, health report and
//! timer request is recorded here and executed by the caller after the
//! transition returns, in enqueue order.

use std::time::Duration;

use serde::Serialize;

use crate::reliability::{
    ActivateMessageBody, ConfigurationMessageBody, DeactivateMessageBody,
    DoReconfigurationMessageBody, GetLsnReplyMessageBody, NodeInstance, ReplicaDescription,
    ReplicaMessageBody, ReplicaReplyMessageBody,
};

use super::health::ReplicaHealthEvent;

/// Messages to the reconfiguration agent on another node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RaMessage {
    GetLsn(ReplicaMessageBody),
    GetLsnReply(GetLsnReplyMessageBody),
    /// `is_force` asks the remote node to restart its replica
    Deactivate {
        body: DeactivateMessageBody,
        is_force: bool,
    },
    DeactivateReply(ReplicaReplyMessageBody),
    Activate(ActivateMessageBody),
    ActivateReply(ReplicaReplyMessageBody),
    CreateReplica(ReplicaMessageBody),
    ContinueSwapPrimary(DoReconfigurationMessageBody),
}

impl RaMessage {
    pub fn name(&self) -> &'static str {
        match self {
            RaMessage::GetLsn(_) => "GetLSN",
            RaMessage::GetLsnReply(_) => "GetLSNReply",
            RaMessage::Deactivate { .. } => "Deactivate",
            RaMessage::DeactivateReply(_) => "DeactivateReply",
            RaMessage::Activate(_) => "Activate",
            RaMessage::ActivateReply(_) => "ActivateReply",
            RaMessage::CreateReplica(_) => "CreateReplica",
            RaMessage::ContinueSwapPrimary(_) => "ContinueSwapPrimary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateConfigurationMode {
    None,
    /// Catch up the configuration before the role change completes
    Catchup,
    /// Every up ready replica is activated; grant write status
    EndReconfiguration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicaCloseMode {
    /// Keep persisted state; the replica goes down
    Close,
    /// Remove the replica and its state
    Drop,
    /// Close and reopen from persisted state
    Restart,
    /// Drop without waiting for the service to cooperate
    Abort,
}

impl ReplicaCloseMode {
    pub fn is_drop_implied(&self) -> bool {
        matches!(self, ReplicaCloseMode::Drop | ReplicaCloseMode::Abort)
    }
}

/// Messages to the local replicator / hosting proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProxyMessage {
    ReplicaOpen {
        replica: ReplicaDescription,
        reopen: bool,
    },
    ReplicaClose {
        replica: ReplicaDescription,
        mode: ReplicaCloseMode,
    },
    ReplicatorGetStatus(ReplicaDescription),
    UpdateConfiguration {
        configuration: ConfigurationMessageBody,
        mode: UpdateConfigurationMode,
    },
    CancelCatchup(ReplicaDescription),
    BuildIdleReplica(ReplicaDescription),
    RemoveIdleReplica(ReplicaDescription),
}

/// Messages to the failover manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FmMessage {
    DoReconfigurationReply(ConfigurationMessageBody),
    ChangeConfiguration(ConfigurationMessageBody),
    DataLossReport(ConfigurationMessageBody),
    AddReplicaReply(ReplicaReplyMessageBody),
    RemoveReplicaReply(ReplicaReplyMessageBody),
    ReplicaDropped(ReplicaMessageBody),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StateMachineAction {
    SendToRa {
        target: NodeInstance,
        message: RaMessage,
    },
    SendToProxy(ProxyMessage),
    SendToFm(FmMessage),
    ReportHealth(ReplicaHealthEvent),
    ArmRetryTimer(Duration),
    CancelRetryTimer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateMachineActionQueue {
    actions: Vec<StateMachineAction>,
}

impl StateMachineActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, action: StateMachineAction) {
        self.actions.push(action);
    }

    pub fn send_to_ra(&mut self, target: NodeInstance, message: RaMessage) {
        self.enqueue(StateMachineAction::SendToRa { target, message });
    }

    pub fn send_to_proxy(&mut self, message: ProxyMessage) {
        self.enqueue(StateMachineAction::SendToProxy(message));
    }

    pub fn send_to_fm(&mut self, message: FmMessage) {
        self.enqueue(StateMachineAction::SendToFm(message));
    }

    pub fn report_health(&mut self, event: ReplicaHealthEvent) {
        self.enqueue(StateMachineAction::ReportHealth(event));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateMachineAction> {
        self.actions.iter()
    }

    /// Hand the queued actions to the executor, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<StateMachineAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }

    /// RA messages queued for one node, by name.
    pub fn ra_messages_to(&self, node_id: u64) -> Vec<&RaMessage> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                StateMachineAction::SendToRa { target, message } if target.id == node_id => {
                    Some(message)
                }
                _ => None,
            })
            .collect()
    }

    pub fn proxy_messages(&self) -> Vec<&ProxyMessage> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                StateMachineAction::SendToProxy(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn fm_messages(&self) -> Vec<&FmMessage> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                StateMachineAction::SendToFm(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn health_events(&self) -> Vec<&ReplicaHealthEvent> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                StateMachineAction::ReportHealth(event) => Some(event),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::{FailoverUnitDescription, ReplicaRole, ServiceDescription};
    use uuid::Uuid;

    fn replica_body(node: u64) -> ReplicaMessageBody {
        ReplicaMessageBody {
            failover_unit: FailoverUnitDescription::new(Uuid::new_v4()),
            service: ServiceDescription::stateful("svc", 3, 2, true),
            replica: ReplicaDescription::new(NodeInstance::new(node, 1), node as i64, 1)
                .with_roles(ReplicaRole::None, ReplicaRole::Secondary),
        }
    }

    #[test]
    fn test_actions_kept_in_order() {
        let mut queue = StateMachineActionQueue::new();
        queue.send_to_ra(NodeInstance::new(2, 1), RaMessage::GetLsn(replica_body(2)));
        queue.enqueue(StateMachineAction::ArmRetryTimer(Duration::from_secs(5)));
        queue.send_to_ra(NodeInstance::new(3, 1), RaMessage::GetLsn(replica_body(3)));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.ra_messages_to(2).len(), 1);
        assert_eq!(queue.ra_messages_to(2)[0].name(), "GetLSN");
        assert!(queue.ra_messages_to(4).is_empty());

        let drained = queue.drain();
        assert!(queue.is_empty());
        assert!(matches!(drained[1], StateMachineAction::ArmRetryTimer(_)));
    }

    #[test]
    fn test_filters() {
        let mut queue = StateMachineActionQueue::new();
        queue.report_health(ReplicaHealthEvent::ClearHealth);
        queue.send_to_proxy(ProxyMessage::CancelCatchup(replica_body(1).replica));
        assert_eq!(queue.health_events().len(), 1);
        assert_eq!(queue.proxy_messages().len(), 1);
        assert!(queue.fm_messages().is_empty());
    }

    #[test]
    fn test_close_mode_drop_implied() {
        assert!(ReplicaCloseMode::Drop.is_drop_implied());
        assert!(ReplicaCloseMode::Abort.is_drop_implied());
        assert!(!ReplicaCloseMode::Restart.is_drop_implied());
        assert!(!ReplicaCloseMode::Close.is_drop_implied());
    }
}
