//! Failover unit state machine
//!
//! One `FailoverUnit` per partition replica on a node. It owns the replica
//! set, the reconfiguration stage and the local replica lifecycle. Every
//! entry point takes an `ExecutionContext`, mutates state synchronously and
//! queues its side effects; nothing here blocks or performs I/O.
//!
//! Entry points return `RaResult<bool>`. `Ok(false)` means the input was
//! stale and has been dropped; `Err` is reserved for a closed failover unit,
//! malformed input and broken invariants.
//!
//! Layout:
//! - `reconfiguration`: DoReconfiguration handling and progress dispatch
//! - `phases`: Phase0 through Phase4 on the primary
//! - `secondary`: GetLSN, Deactivate and Activate on the receiving side
//! - `idle`: idle replica build and removal
//! - `lifecycle`: local replica open, close and retries
//! - `resend`: retry timer driven resends
//! - `configuration`: self report and configuration rewrites

mod configuration;
mod idle;
mod lifecycle;
mod phases;
mod reconfiguration;
mod resend;
mod secondary;

use serde::Serialize;
use uuid::Uuid;

use crate::observability::{log_event_with_fields, Event};
use crate::reliability::{
    ConfigurationMessageBody, Epoch, FailoverUnitDescription, NodeInstance,
    ReplicaDeactivationInfo, ReplicaDescription, ReplicaMessageBody, ReplicaRole,
    ServiceDescription,
};

use super::action_queue::{ReplicaCloseMode, StateMachineAction};
use super::context::ExecutionContext;
use super::errors::{RaError, RaResult};
use super::health::ReconfigurationHealthState;
use super::reconfiguration_state::{ReconfigurationStage, ReconfigurationState};
use super::replica::{Replica, ReplicaStates};
use super::replica_store::ReplicaStore;
use super::retryable_error::RetryableErrorState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailoverUnitState {
    Open,
    /// The local replica is gone for good. Terminal.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicaOpenMode {
    Open,
    /// Open persisted state left behind by an earlier instance
    Reopen,
}

/// Where the local replica is in its hosting lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LocalReplicaLifecycle {
    Opening(ReplicaOpenMode),
    Open,
    Closing {
        mode: ReplicaCloseMode,
        /// Node waiting for a DeactivateReply once the close finishes
        sender: Option<NodeInstance>,
    },
    /// Closed with persisted state kept; can be reopened
    Down,
}

#[derive(Debug, Clone)]
pub struct FailoverUnit {
    description: FailoverUnitDescription,
    service: ServiceDescription,
    intermediate_configuration_epoch: Epoch,
    replicas: ReplicaStore,
    reconfiguration: ReconfigurationState,
    retryable_error: RetryableErrorState,
    reconfiguration_health: ReconfigurationHealthState,
    state: FailoverUnitState,
    lifecycle: LocalReplicaLifecycle,
    deactivation_info: ReplicaDeactivationInfo,
    data_loss_version_to_report: Option<i64>,
    update_replicator_configuration: bool,
    message_retry_active: bool,
    sender_node: Option<NodeInstance>,
    change_configuration: Option<ConfigurationMessageBody>,
}

impl FailoverUnit {
    /// Build a failover unit from a known configuration.
    ///
    /// `replicas` must contain the local replica. Remote replicas keep the
    /// roles and states they are given. The local replica is considered
    /// open.
    pub fn new(
        description: FailoverUnitDescription,
        service: ServiceDescription,
        replicas: &[ReplicaDescription],
        local_node_id: u64,
    ) -> RaResult<Self> {
        let local = replicas
            .iter()
            .find(|r| r.node.id == local_node_id)
            .ok_or_else(|| {
                RaError::invalid_message(format!(
                    "local replica on node {} missing from configuration",
                    local_node_id
                ))
            })?;

        let mut store = ReplicaStore::new(Replica::new(local));
        for desc in replicas.iter().filter(|r| r.node.id != local_node_id) {
            store.add_remote(Replica::new(desc));
        }

        let failover_unit = Self {
            description,
            service,
            intermediate_configuration_epoch: Epoch::INVALID,
            replicas: store,
            reconfiguration: ReconfigurationState::new(),
            retryable_error: RetryableErrorState::new(),
            reconfiguration_health: ReconfigurationHealthState::default(),
            state: FailoverUnitState::Open,
            lifecycle: LocalReplicaLifecycle::Open,
            deactivation_info: ReplicaDeactivationInfo::dropped(),
            data_loss_version_to_report: None,
            update_replicator_configuration: false,
            message_retry_active: false,
            sender_node: None,
            change_configuration: None,
        };

        failover_unit.check_invariants()?;
        Ok(failover_unit)
    }

    /// A freshly assigned partition: invalid epochs and only the local
    /// replica, which still has to be opened.
    pub fn create_empty(
        failover_unit_id: Uuid,
        service: ServiceDescription,
        local: NodeInstance,
        replica_id: i64,
        instance_id: i64,
    ) -> Self {
        let desc = ReplicaDescription::new(local, replica_id, instance_id);
        let mut replica = Replica::new(&desc);
        replica.state = ReplicaStates::InCreate;

        Self {
            description: FailoverUnitDescription::new(failover_unit_id),
            service,
            intermediate_configuration_epoch: Epoch::INVALID,
            replicas: ReplicaStore::new(replica),
            reconfiguration: ReconfigurationState::new(),
            retryable_error: RetryableErrorState::new(),
            reconfiguration_health: ReconfigurationHealthState::default(),
            state: FailoverUnitState::Open,
            lifecycle: LocalReplicaLifecycle::Down,
            deactivation_info: ReplicaDeactivationInfo::dropped(),
            data_loss_version_to_report: None,
            update_replicator_configuration: false,
            message_retry_active: false,
            sender_node: None,
            change_configuration: None,
        }
    }

    pub fn failover_unit_id(&self) -> Uuid {
        self.description.failover_unit_id
    }

    pub fn description(&self) -> &FailoverUnitDescription {
        &self.description
    }

    pub fn service(&self) -> &ServiceDescription {
        &self.service
    }

    pub fn previous_configuration_epoch(&self) -> Epoch {
        self.description.previous_configuration_epoch
    }

    pub fn current_configuration_epoch(&self) -> Epoch {
        self.description.current_configuration_epoch
    }

    pub fn intermediate_configuration_epoch(&self) -> Epoch {
        self.intermediate_configuration_epoch
    }

    pub fn replicas(&self) -> &ReplicaStore {
        &self.replicas
    }

    pub fn local_replica(&self) -> &Replica {
        self.replicas.local()
    }

    pub fn replica(&self, node_id: u64) -> Option<&Replica> {
        self.replicas.get(node_id)
    }

    pub fn reconfiguration(&self) -> &ReconfigurationState {
        &self.reconfiguration
    }

    pub fn reconfiguration_stage(&self) -> ReconfigurationStage {
        self.reconfiguration.stage()
    }

    pub fn retryable_error(&self) -> &RetryableErrorState {
        &self.retryable_error
    }

    pub fn state(&self) -> FailoverUnitState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == FailoverUnitState::Closed
    }

    pub fn lifecycle(&self) -> LocalReplicaLifecycle {
        self.lifecycle
    }

    pub fn is_local_replica_open(&self) -> bool {
        self.lifecycle == LocalReplicaLifecycle::Open
    }

    pub fn is_local_replica_closing(&self) -> bool {
        matches!(self.lifecycle, LocalReplicaLifecycle::Closing { .. })
    }

    pub fn deactivation_info(&self) -> ReplicaDeactivationInfo {
        self.deactivation_info
    }

    /// Data loss version reported to FM, once Phase1 has detected data loss.
    pub fn data_loss_version_to_report(&self) -> Option<i64> {
        self.data_loss_version_to_report
    }

    pub fn is_update_replicator_configuration(&self) -> bool {
        self.update_replicator_configuration
    }

    pub fn is_message_retry_active(&self) -> bool {
        self.message_retry_active
    }

    pub fn sender_node(&self) -> Option<NodeInstance> {
        self.sender_node
    }

    /// The configuration last proposed to FM through ChangeConfiguration.
    pub fn change_configuration(&self) -> Option<&ConfigurationMessageBody> {
        self.change_configuration.as_ref()
    }

    pub fn has_persisted_state(&self) -> bool {
        self.service.has_persisted_state
    }

    fn is_local_primary(&self) -> bool {
        self.replicas.local().cc_role == ReplicaRole::Primary
    }

    fn ensure_open(&self) -> RaResult<()> {
        if self.is_closed() {
            return Err(RaError::closed(format!(
                "failover unit {} is closed",
                self.failover_unit_id()
            )));
        }
        Ok(())
    }

    /// Drop a message that no longer applies to the current state.
    fn drop_stale(&self, ctx: &ExecutionContext<'_>, message: &str) -> RaResult<bool> {
        self.log_stale(ctx, message);
        Ok(false)
    }

    fn log_stale(&self, ctx: &ExecutionContext<'_>, message: &str) {
        ctx.metrics.increment_stale_messages_dropped();
        log_event_with_fields(
            Event::StaleMessageDropped,
            &[
                ("failover_unit", &self.failover_unit_id().to_string()),
                ("message", message),
                ("epoch", &self.current_configuration_epoch().to_string()),
            ],
        );
    }

    fn log_stage(&self, event: Event) {
        log_event_with_fields(
            event,
            &[
                ("failover_unit", &self.failover_unit_id().to_string()),
                ("stage", self.reconfiguration.stage().as_str()),
                ("epoch", &self.current_configuration_epoch().to_string()),
            ],
        );
    }

    /// Arm or cancel the retry timer. Only transitions queue an action, so
    /// cancelling twice is a no-op.
    fn set_message_retry_active(&mut self, active: bool, ctx: &mut ExecutionContext<'_>) {
        if self.message_retry_active == active {
            return;
        }
        self.message_retry_active = active;

        if active {
            let interval = ctx
                .config
                .message_retry_interval()
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            ctx.queue.enqueue(StateMachineAction::ArmRetryTimer(interval));
        } else {
            ctx.queue.enqueue(StateMachineAction::CancelRetryTimer);
        }
    }

    fn replica_message_body(&self, replica: &Replica) -> ReplicaMessageBody {
        ReplicaMessageBody {
            failover_unit: self.description,
            service: self.service.clone(),
            replica: replica.replica_description(),
        }
    }

    /// Every replica in PC or CC, with PC and CC roles.
    fn configuration_body(&self) -> ConfigurationMessageBody {
        ConfigurationMessageBody {
            failover_unit: self.description,
            service: self.service.clone(),
            replicas: self
                .replicas
                .configuration()
                .map(|r| r.replica_description())
                .collect(),
        }
    }

    /// Configuration sent in Deactivate/Activate to the replica on `target`.
    fn configuration_body_for(&self, target: u64) -> ConfigurationMessageBody {
        ConfigurationMessageBody {
            failover_unit: self.description,
            service: self.service.clone(),
            replicas: self
                .replicas
                .configuration()
                .map(|r| r.description_for_deactivate_or_activate(r.node.id == target))
                .collect(),
        }
    }

    /// Structural checks run after every transition. A failure means the
    /// state can no longer be trusted.
    pub fn check_invariants(&self) -> RaResult<()> {
        if self.replicas.current_primary_count() > 1 {
            return Err(self.invariant_violation(format!(
                "{} replicas hold the primary role",
                self.replicas.current_primary_count()
            )));
        }

        let pc = self.previous_configuration_epoch();
        let cc = self.current_configuration_epoch();
        if pc.is_valid() && cc.is_valid() && pc > cc {
            return Err(self.invariant_violation(format!(
                "previous configuration epoch {} is ahead of current {}",
                pc, cc
            )));
        }

        Ok(())
    }

    fn invariant_violation(&self, message: String) -> RaError {
        log_event_with_fields(
            Event::InvariantViolation,
            &[
                ("failover_unit", &self.failover_unit_id().to_string()),
                ("reason", &message),
            ],
        );
        RaError::invariant_violation(message)
    }

    /// Finish an entry point: verify invariants and pass the result on.
    fn complete(&self, processed: bool) -> RaResult<bool> {
        self.check_invariants()?;
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MetricsRegistry;
    use crate::ra::action_queue::StateMachineActionQueue;
    use crate::ra::config::FailoverConfig;
    use crate::ra::RaErrorKind;
    use chrono::{DateTime, Utc};

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn desc(node: u64, pc: ReplicaRole, cc: ReplicaRole) -> ReplicaDescription {
        ReplicaDescription::new(NodeInstance::new(node, 1), node as i64, 1).with_roles(pc, cc)
    }

    fn unit(replicas: &[ReplicaDescription]) -> RaResult<FailoverUnit> {
        FailoverUnit::new(
            FailoverUnitDescription::new(Uuid::new_v4())
                .with_epochs(Epoch::INVALID, Epoch::from_parts(0, 1, 1)),
            ServiceDescription::stateful("svc", 3, 2, true),
            replicas,
            1,
        )
    }

    #[test]
    fn test_new_places_local_first() {
        let fu = unit(&[
            desc(3, ReplicaRole::None, ReplicaRole::Secondary),
            desc(1, ReplicaRole::None, ReplicaRole::Primary),
            desc(2, ReplicaRole::None, ReplicaRole::Secondary),
        ])
        .unwrap();

        let order: Vec<u64> = fu.replicas().iter().map(|r| r.node.id).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(fu.is_local_replica_open());
        assert!(!fu.reconfiguration().is_reconfiguring());
    }

    #[test]
    fn test_new_requires_local_replica() {
        let err = unit(&[desc(2, ReplicaRole::None, ReplicaRole::Primary)]).unwrap_err();
        assert_eq!(err.kind, RaErrorKind::InvalidMessage);
    }

    #[test]
    fn test_two_primaries_rejected() {
        let err = unit(&[
            desc(1, ReplicaRole::None, ReplicaRole::Primary),
            desc(2, ReplicaRole::None, ReplicaRole::Primary),
        ])
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_retry_timer_transitions_only() {
        let config = FailoverConfig::default();
        let metrics = MetricsRegistry::new();
        let mut queue = StateMachineActionQueue::new();
        let mut fu = unit(&[desc(1, ReplicaRole::None, ReplicaRole::Primary)]).unwrap();

        {
            let mut ctx = ExecutionContext::new(now(), &config, &mut queue, &metrics);
            fu.set_message_retry_active(true, &mut ctx);
            fu.set_message_retry_active(true, &mut ctx);
            fu.set_message_retry_active(false, &mut ctx);
            fu.set_message_retry_active(false, &mut ctx);
        }

        let actions = queue.drain();
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], StateMachineAction::ArmRetryTimer(_)));
        assert_eq!(actions[1], StateMachineAction::CancelRetryTimer);
    }

    #[test]
    fn test_create_empty() {
        let fu = FailoverUnit::create_empty(
            Uuid::new_v4(),
            ServiceDescription::stateful("svc", 3, 2, true),
            NodeInstance::new(4, 1),
            40,
            1,
        );
        assert!(!fu.current_configuration_epoch().is_valid());
        assert_eq!(fu.replicas().len(), 1);
        assert!(fu.local_replica().is_in_create());
        assert_eq!(fu.lifecycle(), LocalReplicaLifecycle::Down);
    }
}
