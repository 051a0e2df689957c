//! Replica deactivation info
//!
//! Records the epoch in which a replica was last caught up by a primary and
//! the LSN it was caught up to. Primary election uses it to rule out
//! replicas that only hold progress from an older primary.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::epoch::Epoch;
use super::replica_description::INVALID_LSN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaDeactivationInfo {
    pub epoch: Epoch,
    pub catchup_lsn: i64,
}

impl ReplicaDeactivationInfo {
    pub fn new(epoch: Epoch, catchup_lsn: i64) -> Self {
        Self { epoch, catchup_lsn }
    }

    /// Info for a replica that has never been caught up.
    pub fn dropped() -> Self {
        Self {
            epoch: Epoch::INVALID,
            catchup_lsn: INVALID_LSN,
        }
    }

    pub fn is_dropped(&self) -> bool {
        !self.epoch.is_valid()
    }

    pub fn is_valid(&self) -> bool {
        self.epoch.is_valid()
    }
}

impl Default for ReplicaDeactivationInfo {
    fn default() -> Self {
        Self::dropped()
    }
}

impl fmt::Display for ReplicaDeactivationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.catchup_lsn)
    }
}
