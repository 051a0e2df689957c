//! Replica descriptions exchanged between nodes
//!
//! A `ReplicaDescription` is an immutable snapshot of one replica as seen by
//! some node. It is what travels in messages and node reports; the mutable
//! per-partition view lives in `ra::Replica`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// LSN value meaning "no progress reported".
pub const INVALID_LSN: i64 = -1;

/// Role of a replica in a configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    #[default]
    None,
    Idle,
    Secondary,
    Primary,
}

impl ReplicaRole {
    /// Single-character code used in traces.
    pub fn code(&self) -> char {
        match self {
            ReplicaRole::None => 'N',
            ReplicaRole::Idle => 'I',
            ReplicaRole::Secondary => 'S',
            ReplicaRole::Primary => 'P',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'N' => Some(ReplicaRole::None),
            'I' => Some(ReplicaRole::Idle),
            'S' => Some(ReplicaRole::Secondary),
            'P' => Some(ReplicaRole::Primary),
            _ => None,
        }
    }

    /// Primary and Secondary count towards quorum; Idle and None do not.
    pub fn is_in_configuration(&self) -> bool {
        matches!(self, ReplicaRole::Primary | ReplicaRole::Secondary)
    }
}

/// State of a replica as reported on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaState {
    InBuild,
    #[default]
    Ready,
    StandBy,
    Dropped,
}

impl ReplicaState {
    pub fn code(&self) -> &'static str {
        match self {
            ReplicaState::InBuild => "IB",
            ReplicaState::Ready => "RD",
            ReplicaState::StandBy => "SB",
            ReplicaState::Dropped => "DD",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "IB" => Some(ReplicaState::InBuild),
            "RD" => Some(ReplicaState::Ready),
            "SB" => Some(ReplicaState::StandBy),
            "DD" => Some(ReplicaState::Dropped),
            _ => None,
        }
    }

    /// Freshness rank used when two reports describe the same replica
    /// instance. Higher is fresher.
    pub fn freshness(&self) -> u8 {
        match self {
            ReplicaState::Dropped => 0,
            ReplicaState::StandBy => 1,
            ReplicaState::InBuild => 2,
            ReplicaState::Ready => 3,
        }
    }
}

/// A node identity together with its incarnation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeInstance {
    pub id: u64,
    pub instance: u64,
}

impl NodeInstance {
    pub fn new(id: u64, instance: u64) -> Self {
        Self { id, instance }
    }
}

impl fmt::Display for NodeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.instance)
    }
}

/// Snapshot of a single replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescription {
    pub node: NodeInstance,
    pub replica_id: i64,
    pub instance_id: i64,
    pub previous_role: ReplicaRole,
    pub current_role: ReplicaRole,
    pub state: ReplicaState,
    pub is_up: bool,
    #[serde(default = "invalid_lsn")]
    pub first_acknowledged_lsn: i64,
    #[serde(default = "invalid_lsn")]
    pub last_acknowledged_lsn: i64,
}

fn invalid_lsn() -> i64 {
    INVALID_LSN
}

impl ReplicaDescription {
    /// Create an up, ready description with no roles and no progress.
    pub fn new(node: NodeInstance, replica_id: i64, instance_id: i64) -> Self {
        Self {
            node,
            replica_id,
            instance_id,
            previous_role: ReplicaRole::None,
            current_role: ReplicaRole::None,
            state: ReplicaState::Ready,
            is_up: true,
            first_acknowledged_lsn: INVALID_LSN,
            last_acknowledged_lsn: INVALID_LSN,
        }
    }

    pub fn with_roles(mut self, previous: ReplicaRole, current: ReplicaRole) -> Self {
        self.previous_role = previous;
        self.current_role = current;
        self
    }

    pub fn with_state(mut self, state: ReplicaState) -> Self {
        self.state = state;
        self
    }

    pub fn with_up(mut self, is_up: bool) -> Self {
        self.is_up = is_up;
        self
    }

    pub fn with_progress(mut self, first: i64, last: i64) -> Self {
        self.first_acknowledged_lsn = first;
        self.last_acknowledged_lsn = last;
        self
    }

    pub fn node_id(&self) -> u64 {
        self.node.id
    }

    pub fn is_dropped(&self) -> bool {
        self.state == ReplicaState::Dropped
    }

    pub fn is_ready(&self) -> bool {
        self.state == ReplicaState::Ready
    }

    pub fn is_in_current_configuration(&self) -> bool {
        self.current_role.is_in_configuration()
    }

    pub fn is_in_previous_configuration(&self) -> bool {
        self.previous_role.is_in_configuration()
    }
}

impl fmt::Display for ReplicaDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {}:{} {}/{} {} {} {}]",
            self.node,
            self.replica_id,
            self.instance_id,
            self.previous_role.code(),
            self.current_role.code(),
            self.state.code(),
            if self.is_up { "Up" } else { "Down" },
            self.last_acknowledged_lsn
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_codes() {
        for role in [
            ReplicaRole::None,
            ReplicaRole::Idle,
            ReplicaRole::Secondary,
            ReplicaRole::Primary,
        ] {
            assert_eq!(ReplicaRole::from_code(role.code()), Some(role));
        }
        assert_eq!(ReplicaRole::from_code('X'), None);
    }

    #[test]
    fn test_state_freshness() {
        assert!(ReplicaState::Ready.freshness() > ReplicaState::InBuild.freshness());
        assert!(ReplicaState::InBuild.freshness() > ReplicaState::StandBy.freshness());
        assert!(ReplicaState::StandBy.freshness() > ReplicaState::Dropped.freshness());
    }

    #[test]
    fn test_configuration_membership() {
        let desc = ReplicaDescription::new(NodeInstance::new(1, 1), 1, 1)
            .with_roles(ReplicaRole::Idle, ReplicaRole::Secondary);
        assert!(desc.is_in_current_configuration());
        assert!(!desc.is_in_previous_configuration());
    }

    #[test]
    fn test_json_defaults_lsn() {
        let json = r#"{
            "node": {"id": 3, "instance": 2},
            "replica_id": 3,
            "instance_id": 1,
            "previous_role": "None",
            "current_role": "Primary",
            "state": "Ready",
            "is_up": true
        }"#;
        let desc: ReplicaDescription = serde_json::from_str(json).unwrap();
        assert_eq!(desc.last_acknowledged_lsn, INVALID_LSN);
        assert_eq!(desc.node, NodeInstance::new(3, 2));
    }
}
