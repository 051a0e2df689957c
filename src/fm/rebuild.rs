//! Partition rebuild from node reports
//!
//! After FM loses its state, every node reports what it knows about each
//! partition it hosts. `InBuildFailoverUnit` collects those reports and
//! `generate` turns them into one FM view of the partition.
//!
//! Replicas are merged per node first. The configuration then comes from
//! one of these sources, tried in order:
//! - a report sent by the primary at the newest epoch, taken as is
//! - the newest configuration that has a primary, re-minted at a higher
//!   epoch and re-elected when its primary is gone
//! - nothing: data loss, every replica idle
//!
//! The result does not depend on the order the reports were added.

use std::cmp::Reverse;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::observability::{log_event_with_fields, Event};
use crate::reliability::{
    ConsistencyUnitDescription, Epoch, FailoverUnitInfo, NodeInstance, ReplicaDescription,
    ReplicaRole, ReplicaState, ServiceDescription,
};

use super::errors::{RebuildError, RebuildResult};
use super::failover_unit::{FailoverUnit, FmReplica, ReplicaFlags};
use super::node_cache::NodeCache;

pub const DEFAULT_PRIMARY_EPOCH_INCREMENT: i64 = 4;

/// One node's report for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub source: NodeInstance,
    pub info: FailoverUnitInfo,
}

/// Which configuration of a report a role is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Previous,
    Intermediate,
    Current,
}

/// How the configuration of a generated unit was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RebuildPath {
    Stateless,
    PrimaryReport,
    KeptConfiguration,
    NewPrimary,
    DataLoss,
}

impl RebuildPath {
    fn as_str(&self) -> &'static str {
        match self {
            RebuildPath::Stateless => "stateless",
            RebuildPath::PrimaryReport => "primary_report",
            RebuildPath::KeptConfiguration => "kept_configuration",
            RebuildPath::NewPrimary => "new_primary",
            RebuildPath::DataLoss => "data_loss",
        }
    }
}

/// A replica after every report that mentions it has been merged.
#[derive(Debug, Clone)]
struct MergedReplica {
    description: ReplicaDescription,
    is_deleted: bool,
}

impl MergedReplica {
    fn node_id(&self) -> u64 {
        self.description.node.id
    }

    fn is_available(&self) -> bool {
        self.description.is_up && !self.description.is_dropped()
    }

    fn with_roles(&self, previous: ReplicaRole, current: ReplicaRole) -> FmReplica {
        FmReplica {
            description: self.description.clone().with_roles(previous, current),
            flags: ReplicaFlags {
                is_deleted: self.is_deleted,
                ..ReplicaFlags::default()
            },
        }
    }
}

/// The previous configuration as it will appear in the generated unit.
#[derive(Debug, Clone, Copy)]
struct PreviousConfiguration<'a> {
    epoch: Epoch,
    source: &'a FailoverUnitInfo,
    slot: Slot,
}

impl PreviousConfiguration<'_> {
    fn role(&self, node: u64) -> ReplicaRole {
        role_in(self.source, node, self.slot).unwrap_or(ReplicaRole::None)
    }
}

struct Generated {
    path: RebuildPath,
    previous: Epoch,
    current: Epoch,
    replicas: Vec<FmReplica>,
    is_swapping_primary: bool,
}

type MergedReplicas = BTreeMap<u64, MergedReplica>;

/// Reports collected for one partition during rebuild.
#[derive(Debug, Clone)]
pub struct InBuildFailoverUnit {
    failover_unit_id: Uuid,
    consistency_unit: ConsistencyUnitDescription,
    service: ServiceDescription,
    primary_epoch_increment: i64,
    reports: Vec<NodeReport>,
}

impl InBuildFailoverUnit {
    pub fn new(
        failover_unit_id: Uuid,
        consistency_unit: ConsistencyUnitDescription,
        service: ServiceDescription,
    ) -> Self {
        Self {
            failover_unit_id,
            consistency_unit,
            service,
            primary_epoch_increment: DEFAULT_PRIMARY_EPOCH_INCREMENT,
            reports: Vec::new(),
        }
    }

    /// Start from the first report received for a partition.
    pub fn from_report(info: &FailoverUnitInfo) -> Self {
        Self::new(
            info.failover_unit.failover_unit_id,
            info.failover_unit.consistency_unit,
            info.service.clone(),
        )
    }

    /// Primary epoch step used whenever rebuild mints a new configuration.
    pub fn with_primary_epoch_increment(mut self, increment: i64) -> Self {
        self.primary_epoch_increment = increment;
        self
    }

    pub fn failover_unit_id(&self) -> Uuid {
        self.failover_unit_id
    }

    pub fn reports(&self) -> &[NodeReport] {
        &self.reports
    }

    /// Record one node's report.
    ///
    /// Reports that contradict each other are all kept; `generate` sorts
    /// them out. Only a report that is malformed on its own is rejected.
    pub fn add(&mut self, info: FailoverUnitInfo, source: NodeInstance) -> RebuildResult<()> {
        if info.failover_unit.failover_unit_id != self.failover_unit_id {
            return Err(RebuildError::InconsistentReport(format!(
                "report from node {} is for {}, expected {}",
                source, info.failover_unit.failover_unit_id, self.failover_unit_id
            )));
        }
        if info.pc_epoch() > info.cc_epoch() || info.ic_epoch() > info.cc_epoch() {
            return Err(RebuildError::InconsistentReport(format!(
                "report from node {} has PC {} and IC {} ahead of CC {}",
                source,
                info.pc_epoch(),
                info.ic_epoch(),
                info.cc_epoch()
            )));
        }

        log_event_with_fields(
            Event::RebuildReportAdded,
            &[
                ("failover_unit", &self.failover_unit_id.to_string()),
                ("source", &source.to_string()),
                ("epoch", &info.cc_epoch().to_string()),
            ],
        );

        self.reports.push(NodeReport { source, info });
        Ok(())
    }

    /// Build the FM view from the collected reports.
    ///
    /// `nodes` is the liveness snapshot. A node that is up there is taken to
    /// have sent all of its reports, so a replica its own node did not
    /// report no longer exists.
    ///
    /// Returns `Ok(None)` when no configuration can be established: FM
    /// places the partition afresh instead.
    pub fn generate(
        &self,
        nodes: &NodeCache,
        ignore_constraints: bool,
    ) -> RebuildResult<Option<FailoverUnit>> {
        let reports = self.sorted_reports();
        let Some(latest) = reports.first().copied() else {
            return Ok(self.not_generated("no_reports"));
        };

        let merged = self.merge_replicas(nodes);
        if merged.values().all(|r| r.description.is_dropped()) {
            return Ok(self.not_generated("all_replicas_dropped"));
        }

        let generated = if !self.service.is_stateful {
            self.generate_stateless(latest, &merged)
        } else {
            let primary_reports = self.primary_reports(&reports)?;
            if !primary_reports.is_empty() {
                self.generate_from_primary_report(&primary_reports, &reports, &merged)
            } else if !ignore_constraints && has_conflicting_configurations(&reports) {
                return Ok(self.not_generated("conflicting_configurations"));
            } else {
                self.generate_from_base_configuration(&reports, &merged)
            }
        };

        let primaries = generated
            .replicas
            .iter()
            .filter(|r| r.current_role() == ReplicaRole::Primary)
            .count();
        if primaries > 1 {
            return Err(RebuildError::InconsistentReport(format!(
                "rebuilt configuration of {} has {} primaries",
                self.failover_unit_id, primaries
            )));
        }

        let mut unit = FailoverUnit::new(
            self.failover_unit_id,
            self.consistency_unit,
            self.service.clone(),
            generated.previous,
            generated.current,
            generated.replicas,
        );
        unit.is_swapping_primary = generated.is_swapping_primary;

        log_event_with_fields(
            Event::RebuildGenerated,
            &[
                ("failover_unit", &self.failover_unit_id.to_string()),
                ("path", generated.path.as_str()),
                ("previous_epoch", &generated.previous.to_string()),
                ("epoch", &generated.current.to_string()),
                ("replicas", &unit.replicas().len().to_string()),
            ],
        );

        Ok(Some(unit))
    }

    fn not_generated(&self, reason: &str) -> Option<FailoverUnit> {
        log_event_with_fields(
            Event::RebuildNotGenerated,
            &[
                ("failover_unit", &self.failover_unit_id.to_string()),
                ("reason", reason),
                ("reports", &self.reports.len().to_string()),
            ],
        );
        None
    }

    /// Newest configuration first; ties go to the lower node id.
    fn sorted_reports(&self) -> Vec<&NodeReport> {
        let mut reports: Vec<&NodeReport> = self.reports.iter().collect();
        reports.sort_by_key(|r| {
            (
                Reverse(r.info.cc_epoch()),
                Reverse(r.info.ic_epoch()),
                Reverse(r.info.pc_epoch()),
                r.source.id,
                Reverse(r.source.instance),
                Reverse(r.info.is_report_from_primary),
            )
        });
        reports
    }

    fn merge_replicas(&self, nodes: &NodeCache) -> MergedReplicas {
        let mut best: BTreeMap<u64, ReplicaDescription> = BTreeMap::new();
        let mut own: BTreeMap<u64, ReplicaDescription> = BTreeMap::new();

        for report in &self.reports {
            for replica in &report.info.replicas {
                keep_best(&mut best, &replica.description);
                if replica.description.node.id == report.source.id {
                    keep_best(&mut own, &replica.description);
                }
            }
        }

        let is_volatile = self.service.is_stateful && !self.service.has_persisted_state;

        best.into_iter()
            .map(|(node, mut description)| {
                let mut is_deleted = false;
                if !nodes.is_node_up(node) {
                    description.is_up = false;
                } else if let Some(own) = own.get(&node) {
                    description.is_up = own.is_up;
                } else {
                    description.state = ReplicaState::Dropped;
                    description.is_up = false;
                    is_deleted = true;
                }

                // A volatile replica does not survive going down
                if is_volatile && !description.is_up {
                    description.state = ReplicaState::Dropped;
                }

                (
                    node,
                    MergedReplica {
                        description,
                        is_deleted,
                    },
                )
            })
            .collect()
    }

    /// Reports from the primary at the newest CC. They must all name the
    /// same primary.
    fn primary_reports<'a>(&self, reports: &[&'a NodeReport]) -> RebuildResult<Vec<&'a NodeReport>> {
        let Some(max_cc) = reports.first().map(|r| r.info.cc_epoch()) else {
            return Ok(Vec::new());
        };

        let primary_reports: Vec<&NodeReport> = reports
            .iter()
            .copied()
            .filter(|r| {
                r.info.is_report_from_primary
                    && r.info.cc_epoch() == max_cc
                    && r.info.current_primary().is_some()
            })
            .collect();

        let mut named = primary_reports
            .iter()
            .filter_map(|r| r.info.current_primary())
            .map(|p| p.description.node.id);
        if let Some(first) = named.next() {
            if let Some(second) = named.find(|node| *node != first) {
                log_event_with_fields(
                    Event::InvariantViolation,
                    &[
                        ("failover_unit", &self.failover_unit_id.to_string()),
                        ("reason", "ambiguous_primary"),
                        ("epoch", &max_cc.to_string()),
                    ],
                );
                return Err(RebuildError::AmbiguousPrimary {
                    failover_unit: self.failover_unit_id,
                    first,
                    second,
                });
            }
        }

        Ok(primary_reports)
    }

    fn generate_stateless(&self, latest: &NodeReport, merged: &MergedReplicas) -> Generated {
        let replicas = merged
            .values()
            .map(|m| match latest.info.find_replica(m.node_id()) {
                Some(listed) => m.with_roles(
                    listed.description.previous_role,
                    listed.description.current_role,
                ),
                None => m.with_roles(m.description.previous_role, m.description.current_role),
            })
            .collect();

        Generated {
            path: RebuildPath::Stateless,
            previous: latest.info.pc_epoch(),
            current: latest.info.cc_epoch(),
            replicas,
            is_swapping_primary: false,
        }
    }

    /// The primary knows the configuration; only PC may be stale.
    fn generate_from_primary_report(
        &self,
        primary_reports: &[&NodeReport],
        reports: &[&NodeReport],
        merged: &MergedReplicas,
    ) -> Generated {
        let info = &primary_reports[0].info;
        let previous = previous_configuration(info, reports);
        let pc_valid = previous.epoch.is_valid();

        let replicas = merged
            .values()
            .map(|m| {
                let node = m.node_id();
                let Some(cc_role) = role_in(info, node, Slot::Current) else {
                    let pc_role = if pc_valid {
                        ReplicaRole::Idle
                    } else {
                        ReplicaRole::None
                    };
                    return m.with_roles(pc_role, ReplicaRole::Idle);
                };

                let mut pc_role = previous.role(node);
                if pc_valid && cc_role == ReplicaRole::Idle && pc_role == ReplicaRole::None {
                    pc_role = ReplicaRole::Idle;
                }

                let mut replica = m.with_roles(pc_role, cc_role);
                replica.flags.is_pending_remove =
                    cc_role == ReplicaRole::Idle && !replica.is_up() && !pc_valid;
                replica
            })
            .collect();

        let is_swapping_primary = primary_reports.iter().any(|r| {
            let reporter_up = merged
                .get(&r.source.id)
                .map(|m| m.description.is_up)
                .unwrap_or(false);
            let demoting = r
                .info
                .find_replica(r.source.id)
                .map(|own| {
                    own.description.previous_role == ReplicaRole::Primary
                        && own.description.current_role == ReplicaRole::Secondary
                })
                .unwrap_or(false);
            reporter_up && demoting
        });

        Generated {
            path: RebuildPath::PrimaryReport,
            previous: previous.epoch,
            current: info.cc_epoch(),
            replicas,
            is_swapping_primary,
        }
    }

    /// No primary spoke for the newest configuration. Rebuild from the
    /// newest configuration that has a primary.
    fn generate_from_base_configuration(
        &self,
        reports: &[&NodeReport],
        merged: &MergedReplicas,
    ) -> Generated {
        let max_epoch = reports
            .iter()
            .flat_map(|r| [r.info.pc_epoch(), r.info.ic_epoch(), r.info.cc_epoch()])
            .max()
            .unwrap_or(Epoch::INVALID);

        let Some(base) = reports.iter().find(|r| r.info.current_primary().is_some()) else {
            return self.generate_data_loss(max_epoch, merged);
        };
        let base = &base.info;

        let previous = previous_configuration(base, reports);
        let new_epoch = max_epoch.next_primary(self.primary_epoch_increment);

        let pc_members: Vec<&MergedReplica> = if previous.epoch.is_valid() {
            merged
                .values()
                .filter(|m| previous.role(m.node_id()).is_in_configuration())
                .collect()
        } else {
            Vec::new()
        };
        let cc_members: Vec<&MergedReplica> = merged
            .values()
            .filter(|m| is_in_current_configuration(base, m.node_id()))
            .collect();

        let primary_alive = merged
            .values()
            .find(|m| role_in(base, m.node_id(), Slot::Current) == Some(ReplicaRole::Primary))
            .map(|m| m.is_available() && m.description.is_ready())
            .unwrap_or(false);

        if primary_alive || is_below_read_quorum(&pc_members) || is_below_read_quorum(&cc_members) {
            return keep_configuration(base, previous, new_epoch, merged);
        }

        match elect_primary(base, previous, merged) {
            Some(new_primary) => {
                self.reconfigure_with_new_primary(base, previous, new_primary, new_epoch, merged)
            }
            None => keep_configuration(base, previous, new_epoch, merged),
        }
    }

    fn reconfigure_with_new_primary(
        &self,
        base: &FailoverUnitInfo,
        previous: PreviousConfiguration<'_>,
        new_primary: u64,
        new_epoch: Epoch,
        merged: &MergedReplicas,
    ) -> Generated {
        // The base CC becomes PC unless the base was itself reconfiguring
        let previous = if previous.epoch.is_valid() {
            previous
        } else {
            PreviousConfiguration {
                epoch: base.cc_epoch(),
                source: base,
                slot: Slot::Current,
            }
        };

        let min_replica_set_size = self.service.min_replica_set_size;
        let mut configuration_size = merged
            .values()
            .filter(|m| is_in_current_configuration(base, m.node_id()) && !m.description.is_dropped())
            .count();

        let mut replicas = Vec::with_capacity(merged.len());
        for m in merged.values() {
            let node = m.node_id();

            let replica = match role_in(base, node, Slot::Current) {
                _ if node == new_primary => {
                    let mut replica = m.with_roles(previous.role(node), ReplicaRole::Primary);
                    if replica.description.state == ReplicaState::StandBy {
                        replica.description.state = ReplicaState::InBuild;
                    }
                    replica
                }
                Some(role) if role.is_in_configuration() => {
                    let cc_role = if m.description.is_dropped() {
                        ReplicaRole::None
                    } else if m.description.is_up {
                        ReplicaRole::Secondary
                    } else if role_in(base, node, Slot::Intermediate)
                        .map(|r| r.is_in_configuration())
                        .unwrap_or(false)
                    {
                        ReplicaRole::Secondary
                    } else if configuration_size > min_replica_set_size {
                        configuration_size -= 1;
                        ReplicaRole::Idle
                    } else {
                        ReplicaRole::Secondary
                    };
                    m.with_roles(previous.role(node), cc_role)
                }
                Some(ReplicaRole::None) => {
                    let pc_role = previous.role(node);
                    let cc_role = if pc_role.is_in_configuration() && m.is_available() {
                        ReplicaRole::Secondary
                    } else {
                        ReplicaRole::None
                    };
                    m.with_roles(pc_role, cc_role)
                }
                Some(role) => m.with_roles(previous.role(node), role),
                None => {
                    let mut replica = m.with_roles(ReplicaRole::Idle, ReplicaRole::Idle);
                    if replica.description.state == ReplicaState::Ready {
                        if self.service.has_persisted_state {
                            replica.description.state = ReplicaState::InBuild;
                        } else {
                            replica.flags.is_to_be_dropped_by_fm = true;
                        }
                    }
                    replica
                }
            };
            replicas.push(replica);
        }

        Generated {
            path: RebuildPath::NewPrimary,
            previous: previous.epoch,
            current: new_epoch,
            replicas,
            is_swapping_primary: false,
        }
    }

    /// No configuration with a primary survives anywhere.
    fn generate_data_loss(&self, max_epoch: Epoch, merged: &MergedReplicas) -> Generated {
        let previous = Epoch::new(max_epoch.data_loss_version, 0);
        let current = max_epoch.next_data_loss(self.primary_epoch_increment);

        log_event_with_fields(
            Event::DataLossDetected,
            &[
                ("failover_unit", &self.failover_unit_id.to_string()),
                ("epoch", &current.to_string()),
                ("source", "rebuild"),
            ],
        );

        let replicas = merged
            .values()
            .map(|m| m.with_roles(ReplicaRole::None, ReplicaRole::Idle))
            .collect();

        Generated {
            path: RebuildPath::DataLoss,
            previous,
            current,
            replicas,
            is_swapping_primary: false,
        }
    }
}

/// Keep the base roles; only CC is re-minted.
fn keep_configuration(
    base: &FailoverUnitInfo,
    previous: PreviousConfiguration<'_>,
    new_epoch: Epoch,
    merged: &MergedReplicas,
) -> Generated {
    let pc_valid = previous.epoch.is_valid();
    let replicas = merged
        .values()
        .map(|m| match role_in(base, m.node_id(), Slot::Current) {
            Some(cc_role) => m.with_roles(previous.role(m.node_id()), cc_role),
            None if pc_valid => m.with_roles(ReplicaRole::Idle, ReplicaRole::Idle),
            None => m.with_roles(ReplicaRole::None, ReplicaRole::Idle),
        })
        .collect();

    Generated {
        path: RebuildPath::KeptConfiguration,
        previous: previous.epoch,
        current: new_epoch,
        replicas,
        is_swapping_primary: false,
    }
}

/// Best up CC member: freshest state, then the old primary, then PC
/// membership, then the lowest node id.
fn elect_primary(
    base: &FailoverUnitInfo,
    previous: PreviousConfiguration<'_>,
    merged: &MergedReplicas,
) -> Option<u64> {
    merged
        .values()
        .filter(|m| m.is_available() && is_in_current_configuration(base, m.node_id()))
        .max_by_key(|m| {
            let node = m.node_id();
            (
                m.description.state.freshness(),
                role_in(base, node, Slot::Current) == Some(ReplicaRole::Primary),
                previous.role(node).is_in_configuration(),
                Reverse(node),
            )
        })
        .map(|m| m.node_id())
}

/// PC of `base`, replaced by a newer configuration that some node shows as
/// activated while `base` was still moving away from its PC.
fn previous_configuration<'a>(
    base: &'a FailoverUnitInfo,
    reports: &[&'a NodeReport],
) -> PreviousConfiguration<'a> {
    let own = PreviousConfiguration {
        epoch: base.pc_epoch(),
        source: base,
        slot: Slot::Previous,
    };
    if !base.pc_epoch().is_valid() {
        return own;
    }

    let lower = base.pc_epoch().max(base.ic_epoch());
    let upper = base.cc_epoch();

    reports
        .iter()
        .map(|r| {
            if r.info.pc_epoch().is_valid() {
                (r.info.pc_epoch(), &r.info, Slot::Previous)
            } else {
                (r.info.cc_epoch(), &r.info, Slot::Current)
            }
        })
        .filter(|(epoch, _, _)| *epoch > lower && *epoch < upper)
        .max_by_key(|(epoch, _, _)| *epoch)
        .map(|(epoch, source, slot)| PreviousConfiguration {
            epoch,
            source,
            slot,
        })
        .unwrap_or(own)
}

/// Two nodes went through different reconfigurations out of the same PC.
fn has_conflicting_configurations(reports: &[&NodeReport]) -> bool {
    reports.iter().enumerate().any(|(i, a)| {
        a.info.pc_epoch().is_valid()
            && reports[i + 1..].iter().any(|b| {
                a.info.pc_epoch() == b.info.pc_epoch() && a.info.cc_epoch() != b.info.cc_epoch()
            })
    })
}

fn is_below_read_quorum(members: &[&MergedReplica]) -> bool {
    if members.is_empty() {
        return false;
    }
    let available = members.iter().filter(|m| m.is_available()).count();
    available < (members.len() + 1) / 2
}

fn is_in_current_configuration(info: &FailoverUnitInfo, node: u64) -> bool {
    role_in(info, node, Slot::Current)
        .map(|r| r.is_in_configuration())
        .unwrap_or(false)
}

fn role_in(info: &FailoverUnitInfo, node: u64, slot: Slot) -> Option<ReplicaRole> {
    info.find_replica(node).map(|r| match slot {
        Slot::Previous => r.description.previous_role,
        Slot::Intermediate => r.intermediate_role,
        Slot::Current => r.description.current_role,
    })
}

/// Newer instance, then newer node incarnation, then Dropped, then the
/// fresher state.
fn keep_best(best: &mut BTreeMap<u64, ReplicaDescription>, candidate: &ReplicaDescription) {
    let rank = |d: &ReplicaDescription| {
        (
            d.instance_id,
            d.node.instance,
            d.is_dropped(),
            d.state.freshness(),
            d.is_up,
            d.last_acknowledged_lsn,
        )
    };

    match best.entry(candidate.node.id) {
        Entry::Vacant(slot) => {
            slot.insert(candidate.clone());
        }
        Entry::Occupied(mut slot) => {
            if rank(candidate) > rank(slot.get()) {
                slot.insert(candidate.clone());
            }
        }
    }
}
