//! Local replica open, close and retries
//!
//! The hosting layer performs the actual open and close and reports back.
//! Failures go through `RetryableErrorState`, which decides when to raise
//! health and when to give up on the replica.

use crate::observability::{log_event_with_fields, Event};
use crate::reliability::{NodeInstance, ReplicaDeactivationInfo, ReplicaRole, ReplyError};

use super::super::action_queue::{FmMessage, ProxyMessage, ReplicaCloseMode};
use super::super::context::ExecutionContext;
use super::super::errors::{RaError, RaResult};
use super::super::health::ReplicaHealthEvent;
use super::super::replica::ReplicaStates;
use super::super::retryable_error::{RetryableErrorAction, RetryableErrorStateName};
use super::{FailoverUnit, FailoverUnitState, LocalReplicaLifecycle, ReplicaOpenMode};

impl FailoverUnit {
    /// Ask the host to open the local replica.
    pub fn open_local_replica(&mut self, ctx: &mut ExecutionContext<'_>) -> RaResult<bool> {
        self.ensure_open()?;

        if self.lifecycle != LocalReplicaLifecycle::Down {
            return Err(RaError::invalid_state(format!(
                "local replica of {} is {:?}, expected Down",
                self.failover_unit_id(),
                self.lifecycle
            )));
        }

        self.start_open_local_replica(ReplicaOpenMode::Open, ctx);
        self.complete(true)
    }

    /// Bring a persisted replica that went down back up.
    pub fn reopen_down_replica(&mut self, ctx: &mut ExecutionContext<'_>) -> RaResult<bool> {
        self.ensure_open()?;

        if !self.has_persisted_state() || self.lifecycle != LocalReplicaLifecycle::Down {
            return self.drop_stale(ctx, "ReopenDownReplica");
        }

        self.start_open_local_replica(ReplicaOpenMode::Reopen, ctx);
        self.complete(true)
    }

    fn start_open_local_replica(&mut self, mode: ReplicaOpenMode, ctx: &mut ExecutionContext<'_>) {
        self.lifecycle = LocalReplicaLifecycle::Opening(mode);
        self.retryable_error.enter_state(match mode {
            ReplicaOpenMode::Open => RetryableErrorStateName::ReplicaOpen,
            ReplicaOpenMode::Reopen => RetryableErrorStateName::ReplicaReopen,
        });

        ctx.queue.send_to_proxy(ProxyMessage::ReplicaOpen {
            replica: self.replicas.local().replica_description(),
            reopen: mode == ReplicaOpenMode::Reopen,
        });
    }

    pub fn process_replica_open_reply(
        &mut self,
        error: ReplyError,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        let LocalReplicaLifecycle::Opening(mode) = self.lifecycle else {
            return self.drop_stale(ctx, "ReplicaOpenReply");
        };

        if !error.is_success() {
            match self.retryable_error.on_failure(ctx.config) {
                RetryableErrorAction::Drop => {
                    self.log_lifecycle_give_up("open");
                    self.finish_close_as_dropped(None, ctx);
                }
                RetryableErrorAction::ReportHealthWarning => {
                    ctx.queue.report_health(ReplicaHealthEvent::OpenWarning {
                        failure_count: self.retryable_error.failure_count(),
                    });
                    self.set_message_retry_active(true, ctx);
                }
                _ => self.set_message_retry_active(true, ctx),
            }
            return self.complete(true);
        }

        let is_stateless = !self.service.is_stateful;
        let cc = self.current_configuration_epoch();
        let local = self.replicas.local_mut();
        local.is_up = true;
        local.state = match mode {
            ReplicaOpenMode::Reopen => ReplicaStates::StandBy,
            ReplicaOpenMode::Open if is_stateless || local.cc_role == ReplicaRole::Primary => {
                ReplicaStates::Ready
            }
            ReplicaOpenMode::Open => ReplicaStates::InBuild,
        };
        let is_primary = local.cc_role == ReplicaRole::Primary;

        if is_primary && mode == ReplicaOpenMode::Open {
            self.deactivation_info = ReplicaDeactivationInfo::new(cc, 0);
        }

        self.lifecycle = LocalReplicaLifecycle::Open;
        self.clear_retryable_health(ctx);
        self.complete(true)
    }

    /// Close the local replica. `Drop` and `Abort` also remove its state.
    pub fn close_local_replica(
        &mut self,
        mode: ReplicaCloseMode,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;
        self.start_close_local_replica(mode, None, ctx);
        self.complete(true)
    }

    /// A close already in flight is only escalated, never downgraded.
    pub(super) fn start_close_local_replica(
        &mut self,
        mode: ReplicaCloseMode,
        sender: Option<NodeInstance>,
        ctx: &mut ExecutionContext<'_>,
    ) {
        let (mode, sender) = match self.lifecycle {
            LocalReplicaLifecycle::Closing {
                mode: current,
                sender: current_sender,
            } => {
                let mode = if close_severity(mode) > close_severity(current) {
                    mode
                } else {
                    current
                };
                (mode, sender.or(current_sender))
            }
            _ => (mode, sender),
        };

        self.lifecycle = LocalReplicaLifecycle::Closing { mode, sender };
        self.retryable_error.enter_state(if mode.is_drop_implied() {
            RetryableErrorStateName::ReplicaDelete
        } else {
            RetryableErrorStateName::ReplicaClose
        });

        if mode.is_drop_implied() {
            self.replicas.local_mut().state = ReplicaStates::InDrop;
        }

        log_event_with_fields(
            Event::ReplicaCloseStart,
            &[
                ("failover_unit", &self.failover_unit_id().to_string()),
                ("mode", &format!("{:?}", mode)),
            ],
        );

        ctx.queue.send_to_proxy(ProxyMessage::ReplicaClose {
            replica: self.replicas.local().replica_description(),
            mode,
        });
    }

    pub fn process_replica_close_reply(
        &mut self,
        error: ReplyError,
        ctx: &mut ExecutionContext<'_>,
    ) -> RaResult<bool> {
        self.ensure_open()?;

        let LocalReplicaLifecycle::Closing { mode, sender } = self.lifecycle else {
            return self.drop_stale(ctx, "ReplicaCloseReply");
        };

        if !error.is_success() {
            match self.retryable_error.on_failure(ctx.config) {
                RetryableErrorAction::Drop | RetryableErrorAction::Restart => {
                    self.log_lifecycle_give_up("close");
                    self.start_close_local_replica(ReplicaCloseMode::Abort, sender, ctx);
                }
                RetryableErrorAction::ReportHealthWarning => {
                    ctx.queue.report_health(ReplicaHealthEvent::CloseWarning {
                        failure_count: self.retryable_error.failure_count(),
                    });
                    self.set_message_retry_active(true, ctx);
                }
                _ => self.set_message_retry_active(true, ctx),
            }
            return self.complete(true);
        }

        self.clear_retryable_health(ctx);

        if !self.has_persisted_state() || mode.is_drop_implied() {
            self.finish_close_as_dropped(sender, ctx);
            return self.complete(true);
        }

        self.replicas.local_mut().mark_down();
        self.lifecycle = LocalReplicaLifecycle::Down;
        self.reconfiguration.reset();
        self.set_message_retry_active(false, ctx);

        if let Some(sender) = sender {
            self.send_deactivate_reply(sender, ctx);
        }

        if mode == ReplicaCloseMode::Restart {
            self.start_open_local_replica(ReplicaOpenMode::Reopen, ctx);
        }

        self.complete(true)
    }

    /// The local replica and its state are gone. The unit is closed for good.
    fn finish_close_as_dropped(&mut self, sender: Option<NodeInstance>, ctx: &mut ExecutionContext<'_>) {
        self.replicas.local_mut().mark_as_dropped();
        self.replicas.clear_remote();
        self.deactivation_info = ReplicaDeactivationInfo::dropped();
        self.reconfiguration.reset();
        self.retryable_error.reset();
        self.set_message_retry_active(false, ctx);
        self.lifecycle = LocalReplicaLifecycle::Down;
        self.state = FailoverUnitState::Closed;

        if let Some(sender) = sender {
            self.send_deactivate_reply(sender, ctx);
        }

        ctx.queue.send_to_fm(FmMessage::ReplicaDropped(
            self.replica_message_body(self.replicas.local()),
        ));
    }

    fn clear_retryable_health(&mut self, ctx: &mut ExecutionContext<'_>) {
        let action = self
            .retryable_error
            .on_success_and_transition_to(RetryableErrorStateName::None);
        if action == RetryableErrorAction::ClearHealthReport {
            ctx.queue.report_health(ReplicaHealthEvent::ClearHealth);
        }
    }

    fn log_lifecycle_give_up(&self, operation: &str) {
        log_event_with_fields(
            Event::RetryableErrorThreshold,
            &[
                ("failover_unit", &self.failover_unit_id().to_string()),
                ("operation", operation),
                ("action", "give_up"),
            ],
        );
    }
}

fn close_severity(mode: ReplicaCloseMode) -> u8 {
    match mode {
        ReplicaCloseMode::Close | ReplicaCloseMode::Restart => 0,
        ReplicaCloseMode::Drop => 1,
        ReplicaCloseMode::Abort => 2,
    }
}
