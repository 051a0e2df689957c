//! Node liveness as known to the failover manager

use std::collections::BTreeMap;

use crate::reliability::NodeInstance;

/// Last known incarnation of a node and whether it is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub instance: NodeInstance,
    pub is_up: bool,
}

/// Nodes keyed by id. Only the newest incarnation of a node is kept.
#[derive(Debug, Clone, Default)]
pub struct NodeCache {
    nodes: BTreeMap<u64, NodeInfo>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node coming up. An older incarnation is ignored.
    pub fn node_up(&mut self, instance: NodeInstance) {
        self.update(instance, true);
    }

    /// Record a node going down. An older incarnation is ignored.
    pub fn node_down(&mut self, instance: NodeInstance) {
        self.update(instance, false);
    }

    fn update(&mut self, instance: NodeInstance, is_up: bool) {
        match self.nodes.get_mut(&instance.id) {
            Some(existing) if existing.instance.instance > instance.instance => {}
            Some(existing) => {
                existing.instance = instance;
                existing.is_up = is_up;
            }
            None => {
                self.nodes.insert(instance.id, NodeInfo { instance, is_up });
            }
        }
    }

    pub fn get_node(&self, node_id: u64) -> Option<&NodeInfo> {
        self.nodes.get(&node_id)
    }

    /// Unknown nodes are not up.
    pub fn is_node_up(&self, node_id: u64) -> bool {
        self.nodes.get(&node_id).map(|n| n.is_up).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_node_is_down() {
        let cache = NodeCache::new();
        assert!(!cache.is_node_up(7));
        assert!(cache.get_node(7).is_none());
    }

    #[test]
    fn test_older_instance_ignored() {
        let mut cache = NodeCache::new();
        cache.node_up(NodeInstance::new(1, 2));
        cache.node_down(NodeInstance::new(1, 1));
        assert!(cache.is_node_up(1));

        cache.node_down(NodeInstance::new(1, 2));
        assert!(!cache.is_node_up(1));

        cache.node_up(NodeInstance::new(1, 3));
        assert_eq!(cache.get_node(1).map(|n| n.instance.instance), Some(3));
        assert_eq!(cache.len(), 1);
    }
}
