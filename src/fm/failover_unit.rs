//! Failover manager view of a partition
//!
//! This is what rebuild produces: epochs, the replica set with PC and CC
//! roles, and the flags FM uses to decide what to do next.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reliability::{
    ConsistencyUnitDescription, Epoch, ReplicaDescription, ReplicaRole, ReplicaState,
    ServiceDescription,
};

use super::errors::RebuildResult;
use super::node_cache::NodeCache;
use super::service_cache::ServiceCache;

/// Per replica markers set by rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaFlags {
    /// Down idle replica the primary still lists; FM removes it.
    pub is_pending_remove: bool,
    /// Volatile replica outside the configuration; FM drops it.
    pub is_to_be_dropped_by_fm: bool,
    /// Its node reported without it: the replica no longer exists.
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FmReplica {
    pub description: ReplicaDescription,
    pub flags: ReplicaFlags,
}

impl FmReplica {
    pub fn new(description: ReplicaDescription) -> Self {
        Self {
            description,
            flags: ReplicaFlags::default(),
        }
    }

    pub fn node_id(&self) -> u64 {
        self.description.node.id
    }

    pub fn previous_role(&self) -> ReplicaRole {
        self.description.previous_role
    }

    pub fn current_role(&self) -> ReplicaRole {
        self.description.current_role
    }

    pub fn is_up(&self) -> bool {
        self.description.is_up
    }

    pub fn is_dropped(&self) -> bool {
        self.description.is_dropped()
    }

    /// Up and still holding state.
    pub fn is_available(&self) -> bool {
        self.is_up() && !self.is_dropped()
    }

    pub fn is_ready(&self) -> bool {
        self.description.state == ReplicaState::Ready
    }

    pub fn mark_down(&mut self) {
        self.description.is_up = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnit {
    pub failover_unit_id: Uuid,
    pub consistency_unit: ConsistencyUnitDescription,
    pub service: ServiceDescription,
    pub previous_configuration_epoch: Epoch,
    pub current_configuration_epoch: Epoch,
    /// Primary report came from the old primary demoting to secondary.
    pub is_swapping_primary: bool,
    /// Sorted by node id.
    replicas: Vec<FmReplica>,
}

impl FailoverUnit {
    pub fn new(
        failover_unit_id: Uuid,
        consistency_unit: ConsistencyUnitDescription,
        service: ServiceDescription,
        previous_configuration_epoch: Epoch,
        current_configuration_epoch: Epoch,
        mut replicas: Vec<FmReplica>,
    ) -> Self {
        replicas.sort_by_key(|r| r.node_id());
        Self {
            failover_unit_id,
            consistency_unit,
            service,
            previous_configuration_epoch,
            current_configuration_epoch,
            is_swapping_primary: false,
            replicas,
        }
    }

    pub fn replicas(&self) -> &[FmReplica] {
        &self.replicas
    }

    pub fn find_replica(&self, node_id: u64) -> Option<&FmReplica> {
        self.replicas.iter().find(|r| r.node_id() == node_id)
    }

    pub fn is_stateful(&self) -> bool {
        self.service.is_stateful
    }

    pub fn has_persisted_state(&self) -> bool {
        self.service.has_persisted_state
    }

    pub fn is_changing_configuration(&self) -> bool {
        self.previous_configuration_epoch.is_valid()
    }

    /// The CC primary, if any.
    pub fn primary(&self) -> Option<&FmReplica> {
        self.replicas
            .iter()
            .find(|r| r.current_role() == ReplicaRole::Primary)
    }

    pub fn current_configuration_count(&self) -> usize {
        self.replicas
            .iter()
            .filter(|r| r.current_role().is_in_configuration())
            .count()
    }

    /// A primary exists but CC holds fewer members than MinReplicaSetSize.
    pub fn is_below_min_replica_set_size(&self) -> bool {
        self.is_stateful()
            && self.primary().is_some()
            && self.current_configuration_count() < self.service.min_replica_set_size
    }

    /// Resolve the service description and apply current node liveness.
    pub fn update_pointers(
        &mut self,
        nodes: &NodeCache,
        services: &ServiceCache,
    ) -> RebuildResult<()> {
        self.service = services.get(&self.service.name)?.clone();

        for replica in &mut self.replicas {
            if !nodes.is_node_up(replica.node_id()) {
                replica.mark_down();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::NodeInstance;

    fn replica(node: u64, pc: ReplicaRole, cc: ReplicaRole) -> FmReplica {
        FmReplica::new(
            ReplicaDescription::new(NodeInstance::new(node, 1), node as i64, 1).with_roles(pc, cc),
        )
    }

    fn unit(replicas: Vec<FmReplica>) -> FailoverUnit {
        FailoverUnit::new(
            Uuid::nil(),
            ConsistencyUnitDescription::singleton(Uuid::nil()),
            ServiceDescription::stateful("svc", 3, 2, true),
            Epoch::INVALID,
            Epoch::from_parts(0, 2, 2),
            replicas,
        )
    }

    #[test]
    fn test_replicas_sorted_by_node() {
        let fu = unit(vec![
            replica(3, ReplicaRole::None, ReplicaRole::Secondary),
            replica(1, ReplicaRole::None, ReplicaRole::Primary),
        ]);
        let nodes: Vec<u64> = fu.replicas().iter().map(|r| r.node_id()).collect();
        assert_eq!(nodes, vec![1, 3]);
        assert_eq!(fu.primary().map(|r| r.node_id()), Some(1));
    }

    #[test]
    fn test_below_min_replica_set_size() {
        let fu = unit(vec![
            replica(1, ReplicaRole::None, ReplicaRole::Primary),
            replica(2, ReplicaRole::None, ReplicaRole::Idle),
        ]);
        assert!(fu.is_below_min_replica_set_size());

        let fu = unit(vec![replica(2, ReplicaRole::None, ReplicaRole::Idle)]);
        assert!(!fu.is_below_min_replica_set_size());
    }

    #[test]
    fn test_update_pointers_marks_down_nodes() {
        let mut fu = unit(vec![
            replica(1, ReplicaRole::None, ReplicaRole::Primary),
            replica(2, ReplicaRole::None, ReplicaRole::Secondary),
        ]);
        let mut nodes = NodeCache::new();
        nodes.node_up(NodeInstance::new(1, 1));
        let mut services = ServiceCache::new();
        services.insert(ServiceDescription::stateful("svc", 5, 3, true));

        fu.update_pointers(&nodes, &services).unwrap();
        assert!(fu.find_replica(1).unwrap().is_up());
        assert!(!fu.find_replica(2).unwrap().is_up());
        assert_eq!(fu.service.target_replica_set_size, 5);
    }

    #[test]
    fn test_update_pointers_unknown_service() {
        let mut fu = unit(vec![]);
        assert!(fu
            .update_pointers(&NodeCache::new(), &ServiceCache::new())
            .is_err());
    }
}
