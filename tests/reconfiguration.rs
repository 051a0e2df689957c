//! Reconfiguration Agent Tests
//!
//! Drives a single failover unit through whole reconfigurations by feeding
//! it the replies its queued messages would produce:
//! - failover with GetLSN, catchup, deactivate and activate
//! - Phase1 waiting on silent replicas, data loss
//! - swap primary, completed and aborted
//! - node down, resends and stale replies
//!
//! The local replica always lives on node 1.

use chrono::{DateTime, Duration, Utc};
use fabric_ra::observability::MetricsRegistry;
use fabric_ra::ra::{
    ExecutionContext, FailoverConfig, FailoverUnit, FmMessage, ProxyMessage, RaErrorKind,
    RaMessage, ReconfigurationResult, ReconfigurationStage, ReplicaHealthEvent,
    StateMachineActionQueue, UpdateConfigurationMode,
};
use fabric_ra::reliability::{
    DoReconfigurationMessageBody, Epoch, FailoverUnitDescription, GetLsnReplyMessageBody,
    NodeInstance, ReplicaDeactivationInfo, ReplicaDescription, ReplicaMessageBody,
    ReplicaReplyMessageBody, ReplicaRole, ReplicaState, ReplyError, ServiceDescription,
};
use uuid::Uuid;

use ReplicaRole::{None as N, Primary as P, Secondary as S};

// =============================================================================
// Fixture
// =============================================================================

struct Harness {
    config: FailoverConfig,
    metrics: MetricsRegistry,
    queue: StateMachineActionQueue,
    now: DateTime<Utc>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(FailoverConfig::default())
    }

    fn with_config(config: FailoverConfig) -> Self {
        Self {
            config,
            metrics: MetricsRegistry::new(),
            queue: StateMachineActionQueue::new(),
            now: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    fn ctx(&mut self) -> ExecutionContext<'_> {
        ExecutionContext::new(self.now, &self.config, &mut self.queue, &self.metrics)
    }

    fn advance(&mut self, seconds: i64) {
        self.now += Duration::seconds(seconds);
    }
}

fn epoch(primary_epoch: i64, configuration_number: i64) -> Epoch {
    Epoch::from_parts(0, primary_epoch, configuration_number)
}

fn service() -> ServiceDescription {
    ServiceDescription::stateful("fabric:/TestApp", 3, 2, true)
}

fn desc(node: u64, pc: ReplicaRole, cc: ReplicaRole) -> ReplicaDescription {
    ReplicaDescription::new(NodeInstance::new(node, 1), node as i64, 1).with_roles(pc, cc)
}

fn fu_description(fu: &FailoverUnit, pc: Epoch, cc: Epoch) -> FailoverUnitDescription {
    FailoverUnitDescription::new(fu.failover_unit_id()).with_epochs(pc, cc)
}

fn do_reconfiguration(
    fu: &FailoverUnit,
    pc: Epoch,
    cc: Epoch,
    replicas: Vec<ReplicaDescription>,
) -> DoReconfigurationMessageBody {
    DoReconfigurationMessageBody {
        failover_unit: fu_description(fu, pc, cc),
        service: service(),
        replicas,
        phase0_duration: None,
    }
}

/// Node 1 is a secondary under the primary on node 2.
fn secondary_unit() -> FailoverUnit {
    FailoverUnit::new(
        FailoverUnitDescription::new(Uuid::new_v4()).with_epochs(Epoch::INVALID, epoch(1, 1)),
        service(),
        &[desc(1, N, S), desc(2, N, P), desc(3, N, S)],
        1,
    )
    .unwrap()
}

/// Node 1 is the primary.
fn primary_unit() -> FailoverUnit {
    FailoverUnit::new(
        FailoverUnitDescription::new(Uuid::new_v4()).with_epochs(Epoch::INVALID, epoch(1, 1)),
        service(),
        &[desc(1, N, P), desc(2, N, S), desc(3, N, S)],
        1,
    )
    .unwrap()
}

/// FM promotes node 1 after the primary on node 2 went down.
fn failover_message(fu: &FailoverUnit) -> DoReconfigurationMessageBody {
    do_reconfiguration(
        fu,
        epoch(1, 1),
        epoch(2, 1),
        vec![
            desc(1, S, P),
            desc(2, P, S).with_up(false),
            desc(3, S, S),
        ],
    )
}

fn get_lsn_reply(fu: &FailoverUnit, node: u64, first: i64, last: i64) -> GetLsnReplyMessageBody {
    GetLsnReplyMessageBody {
        failover_unit: *fu.description(),
        replica: desc(node, S, S).with_progress(first, last),
        deactivation_info: ReplicaDeactivationInfo::dropped(),
        error: ReplyError::Success,
    }
}

fn reply(fu: &FailoverUnit, node: u64) -> ReplicaReplyMessageBody {
    ReplicaReplyMessageBody {
        failover_unit: *fu.description(),
        replica: desc(node, S, S),
        error: ReplyError::Success,
    }
}

fn local_progress(first: i64, last: i64) -> ReplicaDescription {
    desc(1, S, P).with_progress(first, last)
}

fn has_get_lsn(h: &Harness, node: u64) -> bool {
    h.queue
        .ra_messages_to(node)
        .iter()
        .any(|m| matches!(m, RaMessage::GetLsn(_)))
}

fn has_update_configuration(h: &Harness, expected: UpdateConfigurationMode) -> bool {
    h.queue.proxy_messages().iter().any(|m| {
        matches!(m, ProxyMessage::UpdateConfiguration { mode, .. } if *mode == expected)
    })
}

/// Runs the failover message and the local replicator status reply.
fn start_failover(h: &mut Harness, fu: &mut FailoverUnit, local_last: i64) {
    let body = failover_message(fu);
    assert!(fu.process_do_reconfiguration(&body, &mut h.ctx()).unwrap());
    fu.process_replicator_get_status_reply(&local_progress(1, local_last), &mut h.ctx())
        .unwrap();
}

// =============================================================================
// Failover
// =============================================================================

/// A secondary promoted by FM walks every phase and reports completion.
#[test]
fn test_failover_runs_all_phases() {
    let mut config = FailoverConfig::default();
    config.skip_phase3_deactivate_when_configuration_unchanged = false;
    let mut h = Harness::with_config(config);
    let mut fu = secondary_unit();

    let body = failover_message(&fu);
    assert!(fu.process_do_reconfiguration(&body, &mut h.ctx()).unwrap());
    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);
    assert!(has_get_lsn(&h, 3));
    assert!(!has_get_lsn(&h, 2));
    assert!(h
        .queue
        .proxy_messages()
        .iter()
        .any(|m| matches!(m, ProxyMessage::ReplicatorGetStatus(_))));
    h.queue.clear();

    // Local progress alone is not a read quorum of three
    fu.process_replicator_get_status_reply(&local_progress(1, 100), &mut h.ctx())
        .unwrap();
    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);

    let lsn_reply = get_lsn_reply(&fu, 3, 1, 90);
    assert!(fu.process_get_lsn_reply(&lsn_reply, &mut h.ctx()).unwrap());
    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::Phase2Catchup);
    assert!(has_update_configuration(&h, UpdateConfigurationMode::Catchup));
    h.queue.clear();

    fu.process_catchup_completed(ReplyError::Success, &local_progress(1, 100), &mut h.ctx())
        .unwrap();
    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::Phase3Deactivate);
    assert_eq!(fu.intermediate_configuration_epoch(), epoch(2, 1));
    assert!(h
        .queue
        .ra_messages_to(3)
        .iter()
        .any(|m| matches!(m, RaMessage::Deactivate { is_force: false, .. })));
    assert!(h.queue.ra_messages_to(2).is_empty());
    h.queue.clear();

    assert!(fu.process_deactivate_reply(&reply(&fu, 3), &mut h.ctx()).unwrap());
    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::Phase4Activate);
    assert!(h
        .queue
        .ra_messages_to(3)
        .iter()
        .any(|m| matches!(m, RaMessage::Activate(_))));
    h.queue.clear();

    assert!(fu.process_activate_reply(&reply(&fu, 3), &mut h.ctx()).unwrap());
    assert!(has_update_configuration(&h, UpdateConfigurationMode::EndReconfiguration));
    h.queue.clear();

    fu.process_update_configuration_reply(UpdateConfigurationMode::EndReconfiguration, &mut h.ctx())
        .unwrap();
    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::None);
    assert_eq!(fu.reconfiguration().result(), ReconfigurationResult::Completed);
    assert!(h
        .queue
        .fm_messages()
        .iter()
        .any(|m| matches!(m, FmMessage::DoReconfigurationReply(_))));

    assert!(!fu.previous_configuration_epoch().is_valid());
    assert_eq!(fu.current_configuration_epoch(), epoch(2, 1));
    assert_eq!(fu.local_replica().cc_role, P);
    assert_eq!(fu.local_replica().pc_role, N);
    assert_eq!(fu.replicas().current_primary_count(), 1);

    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.reconfigurations_started, 1);
    assert_eq!(snapshot.reconfigurations_completed, 1);
}

/// With an unchanged membership Phase3 is skipped.
#[test]
fn test_unchanged_membership_skips_deactivate() {
    let mut h = Harness::new();
    let mut fu = secondary_unit();

    start_failover(&mut h, &mut fu, 100);
    let lsn_reply = get_lsn_reply(&fu, 3, 1, 100);
    fu.process_get_lsn_reply(&lsn_reply, &mut h.ctx()).unwrap();
    fu.process_catchup_completed(ReplyError::Success, &local_progress(1, 100), &mut h.ctx())
        .unwrap();

    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::Phase4Activate);
}

/// A remote replica with more data is proposed to FM instead.
#[test]
fn test_better_replica_triggers_change_configuration() {
    let mut h = Harness::new();
    let mut fu = secondary_unit();

    start_failover(&mut h, &mut fu, 50);
    h.queue.clear();
    let lsn_reply = get_lsn_reply(&fu, 3, 1, 100);
    fu.process_get_lsn_reply(&lsn_reply, &mut h.ctx()).unwrap();

    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::None);
    assert_eq!(
        fu.reconfiguration().result(),
        ReconfigurationResult::ChangeConfiguration
    );
    let proposed = h
        .queue
        .fm_messages()
        .iter()
        .find_map(|m| match m {
            FmMessage::ChangeConfiguration(body) => Some(body.clone()),
            _ => None,
        })
        .expect("change configuration sent");
    assert_eq!(proposed.find_replica(3).unwrap().last_acknowledged_lsn, 100);
    assert_eq!(fu.local_replica().cc_role, S);
    assert_eq!(fu.replicas().current_primary_count(), 1);
    assert_eq!(h.metrics.snapshot().change_configurations, 1);

    // A duplicate is answered from the recorded result
    h.queue.clear();
    let duplicate = failover_message(&fu);
    assert!(!fu.process_do_reconfiguration(&duplicate, &mut h.ctx()).unwrap());
    assert!(h
        .queue
        .fm_messages()
        .iter()
        .any(|m| matches!(m, FmMessage::ChangeConfiguration(_))));
}

// =============================================================================
// Phase1 Waits And Data Loss
// =============================================================================

/// One reply out of three is not enough; the silent replica keeps getting
/// GetLSN on every timer tick.
#[test]
fn test_silent_replicas_block_phase1() {
    let mut h = Harness::new();
    let mut fu = secondary_unit();

    start_failover(&mut h, &mut fu, 100);
    h.queue.clear();

    for _ in 0..3 {
        h.advance(5);
        assert!(fu.on_timer(&mut h.ctx()).unwrap());
        assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);
        assert!(has_get_lsn(&h, 3));
        assert!(!has_get_lsn(&h, 2));
        h.queue.clear();
    }

    assert_eq!(h.metrics.snapshot().message_resends, 3);
    assert!(fu.is_message_retry_active());
}

/// With every replica up, the local progress alone is one of three; both
/// silent replicas are asked again on each tick and Phase1 never finishes.
#[test]
fn test_all_up_silent_replicas_block_phase1() {
    let mut h = Harness::new();
    let mut fu = secondary_unit();

    let body = do_reconfiguration(
        &fu,
        epoch(1, 1),
        epoch(2, 1),
        vec![desc(1, S, P), desc(2, P, S), desc(3, S, S)],
    );
    fu.process_do_reconfiguration(&body, &mut h.ctx()).unwrap();
    fu.process_replicator_get_status_reply(&local_progress(1, 100), &mut h.ctx())
        .unwrap();
    h.queue.clear();

    for _ in 0..4 {
        h.advance(5);
        assert!(fu.on_timer(&mut h.ctx()).unwrap());
        assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);
        assert!(has_get_lsn(&h, 2));
        assert!(has_get_lsn(&h, 3));
        h.queue.clear();
    }

    assert_eq!(h.metrics.snapshot().message_resends, 8);
}

/// A repeated DoReconfiguration that changes nothing does not resend.
#[test]
fn test_duplicate_do_reconfiguration_not_resent() {
    let mut h = Harness::new();
    let mut fu = secondary_unit();

    start_failover(&mut h, &mut fu, 100);
    h.queue.clear();

    let body = failover_message(&fu);
    assert!(fu.process_do_reconfiguration(&body, &mut h.ctx()).unwrap());
    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);
    assert!(!has_get_lsn(&h, 3));
    assert!(!fu.is_update_replicator_configuration());
}

/// A GetLSN requester from before the reconfiguration is forgotten.
#[test]
fn test_new_reconfiguration_clears_sender() {
    let mut h = Harness::new();
    let mut fu = secondary_unit();

    let get_lsn = ReplicaMessageBody {
        failover_unit: *fu.description(),
        service: service(),
        replica: desc(1, N, S),
    };
    fu.process_get_lsn(NodeInstance::new(3, 1), &get_lsn, &mut h.ctx())
        .unwrap();
    assert_eq!(fu.sender_node(), Some(NodeInstance::new(3, 1)));

    let body = failover_message(&fu);
    fu.process_do_reconfiguration(&body, &mut h.ctx()).unwrap();
    assert_eq!(fu.sender_node(), None);
    h.queue.clear();

    fu.process_replicator_get_status_reply(&local_progress(1, 100), &mut h.ctx())
        .unwrap();
    assert!(h
        .queue
        .ra_messages_to(3)
        .iter()
        .all(|m| !matches!(m, RaMessage::GetLsnReply(_))));
}

/// A phase running past the threshold is reported once and cleared when
/// the phase moves on.
#[test]
fn test_stuck_phase1_reported_and_cleared() {
    let mut config = FailoverConfig::default();
    config.reconfiguration_health_report_threshold_ms = 1_000;
    let mut h = Harness::with_config(config);
    let mut fu = secondary_unit();

    start_failover(&mut h, &mut fu, 100);
    h.queue.clear();

    h.advance(2);
    fu.on_timer(&mut h.ctx()).unwrap();
    h.advance(2);
    fu.on_timer(&mut h.ctx()).unwrap();

    let stuck: Vec<_> = h
        .queue
        .health_events()
        .into_iter()
        .filter(|e| matches!(e, ReplicaHealthEvent::ReconfigurationStuck { .. }))
        .cloned()
        .collect();
    assert_eq!(stuck.len(), 1);
    assert!(matches!(
        stuck[0],
        ReplicaHealthEvent::ReconfigurationStuck {
            stage: ReconfigurationStage::Phase1GetLsn,
            ..
        }
    ));
    h.queue.clear();

    let lsn_reply = get_lsn_reply(&fu, 3, 1, 90);
    fu.process_get_lsn_reply(&lsn_reply, &mut h.ctx()).unwrap();
    assert!(h
        .queue
        .health_events()
        .iter()
        .any(|e| matches!(e, ReplicaHealthEvent::ClearReconfigurationStuck)));
}

/// Every other replica dropped: Phase1 reports data loss and continues
/// once FM answers with a newer data loss version.
#[test]
fn test_data_loss_reported_then_resolved() {
    let mut h = Harness::new();
    let mut fu = secondary_unit();

    let body = do_reconfiguration(
        &fu,
        epoch(1, 1),
        epoch(2, 1),
        vec![
            desc(1, S, P),
            desc(2, P, S).with_state(ReplicaState::Dropped).with_up(false),
            desc(3, S, S).with_state(ReplicaState::Dropped).with_up(false),
        ],
    );
    fu.process_do_reconfiguration(&body, &mut h.ctx()).unwrap();
    fu.process_replicator_get_status_reply(&local_progress(1, 100), &mut h.ctx())
        .unwrap();

    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);
    assert_eq!(fu.data_loss_version_to_report(), Some(0));
    assert!(h
        .queue
        .fm_messages()
        .iter()
        .any(|m| matches!(m, FmMessage::DataLossReport(_))));
    assert_eq!(h.metrics.snapshot().data_loss_reports, 1);
    h.queue.clear();

    let mut after_loss = body.clone();
    after_loss.failover_unit.current_configuration_epoch = Epoch::from_parts(1, 2, 1);
    fu.process_do_reconfiguration(&after_loss, &mut h.ctx()).unwrap();

    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::Phase2Catchup);
    assert_eq!(fu.current_configuration_epoch(), Epoch::from_parts(1, 2, 1));
    assert!(!h
        .queue
        .fm_messages()
        .iter()
        .any(|m| matches!(m, FmMessage::DataLossReport(_))));
}

// =============================================================================
// Node Down
// =============================================================================

/// Node down applies once; repeats and older instances change nothing.
#[test]
fn test_node_down_is_idempotent() {
    let mut h = Harness::new();
    let mut fu = secondary_unit();

    start_failover(&mut h, &mut fu, 100);

    let node = NodeInstance::new(3, 1);
    assert!(fu.process_node_down(node, &mut h.ctx()).unwrap());
    assert!(!fu.replica(3).unwrap().is_up);
    let after_first = fu.clone();

    assert!(!fu.process_node_down(node, &mut h.ctx()).unwrap());
    assert!(!fu
        .process_node_down(NodeInstance::new(3, 0), &mut h.ctx())
        .unwrap());
    assert!(!fu
        .process_node_down(NodeInstance::new(9, 1), &mut h.ctx())
        .unwrap());
    assert_eq!(fu.replica(3), after_first.replica(3));
    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);

    // No GetLSN is resent to a down node
    h.queue.clear();
    h.advance(5);
    fu.on_timer(&mut h.ctx()).unwrap();
    assert!(!has_get_lsn(&h, 3));
}

/// The local node cannot be reported down to itself.
#[test]
fn test_local_node_down_rejected() {
    let mut h = Harness::new();
    let mut fu = secondary_unit();

    let err = fu
        .process_node_down(NodeInstance::new(1, 1), &mut h.ctx())
        .unwrap_err();
    assert_eq!(err.kind, RaErrorKind::InvalidMessage);
}

// =============================================================================
// Swap Primary
// =============================================================================

fn swap_message(fu: &FailoverUnit, cc: Epoch) -> DoReconfigurationMessageBody {
    do_reconfiguration(
        fu,
        epoch(1, 1),
        cc,
        vec![desc(1, P, S), desc(2, S, P), desc(3, S, S)],
    )
}

/// The demoting primary catches up the new one and hands over.
#[test]
fn test_swap_primary_demote_hands_over() {
    let mut h = Harness::new();
    let mut fu = primary_unit();

    let body = swap_message(&fu, epoch(2, 1));
    fu.process_do_reconfiguration(&body, &mut h.ctx()).unwrap();
    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::Phase0Demote);
    assert!(has_update_configuration(&h, UpdateConfigurationMode::Catchup));
    assert_eq!(fu.replicas().current_primary().unwrap().node.id, 2);
    h.queue.clear();

    h.advance(3);
    fu.process_catchup_completed(ReplyError::Success, &desc(1, P, S), &mut h.ctx())
        .unwrap();
    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::None);
    assert_eq!(
        fu.reconfiguration().result(),
        ReconfigurationResult::DemoteCompleted
    );
    let continuation = h
        .queue
        .ra_messages_to(2)
        .into_iter()
        .find_map(|m| match m {
            RaMessage::ContinueSwapPrimary(body) => Some(body.clone()),
            _ => None,
        })
        .expect("continuation sent to new primary");
    assert!(continuation.phase0_duration.is_some());

    // FM retrying the swap gets the continuation again
    h.queue.clear();
    assert!(!fu.process_do_reconfiguration(&body, &mut h.ctx()).unwrap());
    assert!(h
        .queue
        .ra_messages_to(2)
        .iter()
        .any(|m| matches!(m, RaMessage::ContinueSwapPrimary(_))));
}

/// A newer primary epoch during Phase0 cancels the catchup and restores the
/// old roles.
#[test]
fn test_swap_primary_abort() {
    let mut h = Harness::new();
    let mut fu = primary_unit();

    let body = swap_message(&fu, epoch(2, 1));
    fu.process_do_reconfiguration(&body, &mut h.ctx()).unwrap();
    h.queue.clear();

    let newer = swap_message(&fu, epoch(3, 1));
    assert!(fu.process_do_reconfiguration(&newer, &mut h.ctx()).unwrap());
    assert_eq!(
        fu.reconfiguration_stage(),
        ReconfigurationStage::AbortPhase0Demote
    );
    assert_eq!(fu.current_configuration_epoch(), epoch(2, 1));
    assert!(h
        .queue
        .proxy_messages()
        .iter()
        .any(|m| matches!(m, ProxyMessage::CancelCatchup(_))));

    // Another newer message while aborting is dropped
    assert_eq!(h.metrics.snapshot().stale_messages_dropped, 0);
    fu.process_do_reconfiguration(&newer, &mut h.ctx()).unwrap();
    assert_eq!(
        fu.reconfiguration_stage(),
        ReconfigurationStage::AbortPhase0Demote
    );
    assert_eq!(fu.current_configuration_epoch(), epoch(2, 1));
    assert_eq!(h.metrics.snapshot().stale_messages_dropped, 1);

    let cancelled = fu_description(&fu, epoch(1, 1), epoch(2, 1));
    assert!(fu
        .process_cancel_catchup_reply(&cancelled, ReplyError::Success, &mut h.ctx())
        .unwrap());
    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::None);
    assert_eq!(
        fu.reconfiguration().result(),
        ReconfigurationResult::AbortSwapPrimary
    );
    assert_eq!(fu.local_replica().cc_role, P);
    assert_eq!(fu.replica(2).unwrap().cc_role, S);
    assert_eq!(fu.replicas().current_primary_count(), 1);
}

// =============================================================================
// Stale Input And Invariants
// =============================================================================

/// Replies for an older configuration are dropped and counted.
#[test]
fn test_stale_get_lsn_reply_dropped() {
    let mut h = Harness::new();
    let mut fu = secondary_unit();

    start_failover(&mut h, &mut fu, 100);

    let mut stale = get_lsn_reply(&fu, 3, 1, 90);
    stale.failover_unit.current_configuration_epoch = epoch(1, 1);
    assert!(!fu.process_get_lsn_reply(&stale, &mut h.ctx()).unwrap());
    assert!(!fu.replica(3).unwrap().is_lsn_set());
    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);
    assert_eq!(h.metrics.snapshot().stale_messages_dropped, 1);

    // A DoReconfiguration older than the current configuration
    let old = do_reconfiguration(&fu, Epoch::INVALID, epoch(1, 1), vec![desc(1, N, P)]);
    assert!(!fu.process_do_reconfiguration(&old, &mut h.ctx()).unwrap());
    assert_eq!(h.metrics.snapshot().stale_messages_dropped, 2);
}

/// A configuration with two primaries is fatal for the failover unit.
#[test]
fn test_two_primaries_fatal() {
    let mut h = Harness::new();
    let mut fu = secondary_unit();

    let body = do_reconfiguration(
        &fu,
        epoch(1, 1),
        epoch(2, 1),
        vec![desc(1, S, P), desc(2, P, P), desc(3, S, S)],
    );
    let err = fu.process_do_reconfiguration(&body, &mut h.ctx()).unwrap_err();
    assert_eq!(err.kind, RaErrorKind::InvariantViolation);
    assert!(err.is_fatal());
}

/// DoReconfiguration without a primary or without the local node is
/// malformed.
#[test]
fn test_malformed_do_reconfiguration() {
    let mut h = Harness::new();
    let mut fu = secondary_unit();

    let no_primary = do_reconfiguration(
        &fu,
        epoch(1, 1),
        epoch(2, 1),
        vec![desc(1, S, S), desc(3, S, S)],
    );
    let err = fu
        .process_do_reconfiguration(&no_primary, &mut h.ctx())
        .unwrap_err();
    assert_eq!(err.kind, RaErrorKind::InvalidMessage);

    let no_local = do_reconfiguration(
        &fu,
        epoch(1, 1),
        epoch(2, 1),
        vec![desc(2, S, P), desc(3, S, S)],
    );
    let err = fu
        .process_do_reconfiguration(&no_local, &mut h.ctx())
        .unwrap_err();
    assert_eq!(err.kind, RaErrorKind::InvalidMessage);
    assert_eq!(fu.reconfiguration_stage(), ReconfigurationStage::None);
}
