//! Partition and service descriptions

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::epoch::Epoch;

/// Service metadata that shapes reconfiguration decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub name: String,
    pub target_replica_set_size: usize,
    pub min_replica_set_size: usize,
    pub is_stateful: bool,
    pub has_persisted_state: bool,
}

impl ServiceDescription {
    pub fn stateful(name: impl Into<String>, target: usize, min: usize, persisted: bool) -> Self {
        Self {
            name: name.into(),
            target_replica_set_size: target,
            min_replica_set_size: min,
            is_stateful: true,
            has_persisted_state: persisted,
        }
    }

    pub fn stateless(name: impl Into<String>, instance_count: usize) -> Self {
        Self {
            name: name.into(),
            target_replica_set_size: instance_count,
            min_replica_set_size: 0,
            is_stateful: false,
            has_persisted_state: false,
        }
    }
}

/// Partition key range owned by a failover unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyUnitDescription {
    pub id: Uuid,
    pub low_key: i64,
    pub high_key: i64,
}

impl ConsistencyUnitDescription {
    /// Singleton partition covering the whole key space.
    pub fn singleton(id: Uuid) -> Self {
        Self {
            id,
            low_key: i64::MIN,
            high_key: i64::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnitDescription {
    pub failover_unit_id: Uuid,
    pub consistency_unit: ConsistencyUnitDescription,
    pub current_configuration_epoch: Epoch,
    pub previous_configuration_epoch: Epoch,
}

impl FailoverUnitDescription {
    pub fn new(failover_unit_id: Uuid) -> Self {
        Self {
            failover_unit_id,
            consistency_unit: ConsistencyUnitDescription::singleton(failover_unit_id),
            current_configuration_epoch: Epoch::INVALID,
            previous_configuration_epoch: Epoch::INVALID,
        }
    }

    pub fn with_epochs(mut self, pc: Epoch, cc: Epoch) -> Self {
        self.previous_configuration_epoch = pc;
        self.current_configuration_epoch = cc;
        self
    }

    /// PC and CC were produced under different primaries.
    pub fn is_primary_change_between_pc_and_cc(&self) -> bool {
        self.previous_configuration_epoch.to_primary_epoch()
            != self.current_configuration_epoch.to_primary_epoch()
    }

    pub fn is_data_loss_between_pc_and_cc(&self) -> bool {
        self.previous_configuration_epoch.data_loss_version
            != self.current_configuration_epoch.data_loss_version
    }
}
