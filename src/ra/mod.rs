//! Reconfiguration agent
//!
//! Runs on every node and owns one `FailoverUnit` per hosted partition
//! replica. FM instructs it through DoReconfiguration; it drives the replica
//! set through the reconfiguration phases and reports back.
//!
//! Invariants held by every transition:
//! - At most one replica holds the primary role in CC
//! - PC never moves ahead of CC
//! - Stale input is dropped and logged, never applied
//! - No I/O: side effects are queued on `StateMachineActionQueue`
//!
//! A violated invariant is fatal for the failover unit and surfaces as an
//! `RaError` with kind `InvariantViolation`.

mod action_queue;
mod config;
mod context;
mod errors;
mod failover_unit;
mod health;
mod reconfiguration_state;
mod replica;
mod replica_store;
mod retryable_error;

pub use action_queue::{
    FmMessage, ProxyMessage, RaMessage, ReplicaCloseMode, StateMachineAction,
    StateMachineActionQueue, UpdateConfigurationMode,
};
pub use config::FailoverConfig;
pub use context::ExecutionContext;
pub use errors::{RaError, RaErrorKind, RaResult};
pub use failover_unit::{FailoverUnit, FailoverUnitState, LocalReplicaLifecycle, ReplicaOpenMode};
pub use health::{ReconfigurationHealthState, ReplicaHealthEvent};
pub use reconfiguration_state::{
    ReconfigurationProgressStages, ReconfigurationResult, ReconfigurationStage,
    ReconfigurationState, ReconfigurationType, ReplicaSetCounts,
};
pub use replica::{LsnProgress, Replica, ReplicaMessageStage, ReplicaStates};
pub use replica_store::ReplicaStore;
pub use retryable_error::{RetryableErrorAction, RetryableErrorState, RetryableErrorStateName};
