//! Ordered replica collection for one failover unit
//!
//! The local replica is always at index 0. Remote replicas follow, kept
//! sorted by node id so that every scan over the store is deterministic.

use crate::reliability::ReplicaRole;

use super::replica::Replica;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaStore {
    replicas: Vec<Replica>,
}

impl ReplicaStore {
    pub fn new(local: Replica) -> Self {
        Self {
            replicas: vec![local],
        }
    }

    pub fn local(&self) -> &Replica {
        &self.replicas[0]
    }

    pub fn local_mut(&mut self) -> &mut Replica {
        &mut self.replicas[0]
    }

    pub fn local_node_id(&self) -> u64 {
        self.replicas[0].node.id
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn get(&self, node_id: u64) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.node.id == node_id)
    }

    pub fn get_mut(&mut self, node_id: u64) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| r.node.id == node_id)
    }

    pub fn is_local(&self, node_id: u64) -> bool {
        self.local_node_id() == node_id
    }

    /// Insert a remote replica, or replace the one already on that node.
    pub fn add_remote(&mut self, replica: Replica) -> &mut Replica {
        let node_id = replica.node.id;
        if let Some(index) = self.replicas.iter().position(|r| r.node.id == node_id) {
            if index != 0 {
                self.replicas[index] = replica;
            }
            return &mut self.replicas[index];
        }

        let index = self.replicas[1..]
            .iter()
            .position(|r| r.node.id > node_id)
            .map(|p| p + 1)
            .unwrap_or(self.replicas.len());
        self.replicas.insert(index, replica);
        &mut self.replicas[index]
    }

    /// Remove a remote replica. The local replica is never removed.
    pub fn remove(&mut self, node_id: u64) -> Option<Replica> {
        let index = self.replicas.iter().position(|r| r.node.id == node_id)?;
        if index == 0 {
            return None;
        }
        Some(self.replicas.remove(index))
    }

    pub fn retain_remote<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Replica) -> bool,
    {
        let local = self.local_node_id();
        self.replicas.retain(|r| r.node.id == local || keep(r));
    }

    pub fn clear_remote(&mut self) {
        self.replicas.truncate(1);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Replica> {
        self.replicas.iter_mut()
    }

    pub fn remote(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter().skip(1)
    }

    pub fn remote_mut(&mut self) -> impl Iterator<Item = &mut Replica> {
        self.replicas.iter_mut().skip(1)
    }

    /// Replicas in PC or CC, local first.
    pub fn configuration(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter().filter(|r| r.is_in_configuration())
    }

    pub fn configuration_remote(&self) -> impl Iterator<Item = &Replica> {
        self.remote().filter(|r| r.is_in_configuration())
    }

    pub fn configuration_remote_mut(&mut self) -> impl Iterator<Item = &mut Replica> {
        self.remote_mut().filter(|r| r.is_in_configuration())
    }

    pub fn previous_configuration(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter().filter(|r| r.is_in_previous_configuration())
    }

    pub fn current_configuration(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter().filter(|r| r.is_in_current_configuration())
    }

    pub fn current_primary(&self) -> Option<&Replica> {
        self.replicas
            .iter()
            .find(|r| r.cc_role == ReplicaRole::Primary)
    }

    pub fn previous_primary(&self) -> Option<&Replica> {
        self.replicas
            .iter()
            .find(|r| r.pc_role == ReplicaRole::Primary)
    }

    /// Number of replicas whose CC role is Primary. Anything above one is a
    /// broken invariant.
    pub fn current_primary_count(&self) -> usize {
        self.replicas
            .iter()
            .filter(|r| r.cc_role == ReplicaRole::Primary)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::{NodeInstance, ReplicaDescription};

    fn replica(node: u64, cc: ReplicaRole) -> Replica {
        Replica::new(
            &ReplicaDescription::new(NodeInstance::new(node, 1), node as i64, 1)
                .with_roles(ReplicaRole::None, cc),
        )
    }

    #[test]
    fn test_local_stays_first() {
        let mut store = ReplicaStore::new(replica(5, ReplicaRole::Primary));
        store.add_remote(replica(3, ReplicaRole::Secondary));
        store.add_remote(replica(1, ReplicaRole::Secondary));
        store.add_remote(replica(4, ReplicaRole::Idle));

        let order: Vec<u64> = store.iter().map(|r| r.node.id).collect();
        assert_eq!(order, vec![5, 1, 3, 4]);
        assert_eq!(store.local_node_id(), 5);
    }

    #[test]
    fn test_add_replaces_same_node() {
        let mut store = ReplicaStore::new(replica(1, ReplicaRole::Primary));
        store.add_remote(replica(2, ReplicaRole::Secondary));
        store.add_remote(replica(2, ReplicaRole::Idle));
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(2).map(|r| r.cc_role), Some(ReplicaRole::Idle));
    }

    #[test]
    fn test_local_cannot_be_removed() {
        let mut store = ReplicaStore::new(replica(1, ReplicaRole::Primary));
        store.add_remote(replica(2, ReplicaRole::Secondary));
        assert!(store.remove(1).is_none());
        assert!(store.remove(2).is_some());
        assert_eq!(store.len(), 1);

        store.add_remote(replica(3, ReplicaRole::Secondary));
        store.retain_remote(|_| false);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_configuration_subsets() {
        let mut store = ReplicaStore::new(replica(1, ReplicaRole::Primary));
        store.add_remote(replica(2, ReplicaRole::Secondary));
        store.add_remote(replica(3, ReplicaRole::Idle));

        assert_eq!(store.configuration().count(), 2);
        assert_eq!(store.configuration_remote().count(), 1);
        assert_eq!(store.current_primary().map(|r| r.node.id), Some(1));
        assert_eq!(store.current_primary_count(), 1);
        assert!(store.previous_primary().is_none());
    }
}
