//! Configuration epochs
//!
//! An epoch identifies one configuration generation of a partition. It is
//! ordered first by data loss version, then by configuration version. The
//! configuration version packs the primary epoch into the upper 32 bits and
//! the configuration number into the lower 32 bits.

use std::fmt;

use serde::{Deserialize, Serialize};

const CONFIGURATION_NUMBER_MASK: i64 = 0xFFFF_FFFF;

/// `(DataLossVersion, ConfigurationVersion)` pair.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch {
    pub data_loss_version: i64,
    pub configuration_version: i64,
}

impl Epoch {
    /// The zero epoch. Never assigned to a live configuration.
    pub const INVALID: Epoch = Epoch {
        data_loss_version: 0,
        configuration_version: 0,
    };

    pub fn new(data_loss_version: i64, configuration_version: i64) -> Self {
        Self {
            data_loss_version,
            configuration_version,
        }
    }

    /// Build an epoch from its three logical components.
    pub fn from_parts(data_loss_version: i64, primary_epoch: i64, configuration_number: i64) -> Self {
        Self::new(
            data_loss_version,
            (primary_epoch << 32) | (configuration_number & CONFIGURATION_NUMBER_MASK),
        )
    }

    pub fn invalid() -> Self {
        Self::INVALID
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Upper half of the configuration version.
    pub fn primary_epoch(&self) -> i64 {
        self.configuration_version >> 32
    }

    /// Lower half of the configuration version.
    pub fn configuration_number(&self) -> i64 {
        self.configuration_version & CONFIGURATION_NUMBER_MASK
    }

    /// The epoch with the configuration number cleared.
    ///
    /// Two epochs with the same primary epoch were produced under the same
    /// primary, so comparisons that only care about primary changes use this.
    pub fn to_primary_epoch(&self) -> Epoch {
        Epoch::new(
            self.data_loss_version,
            self.configuration_version & !CONFIGURATION_NUMBER_MASK,
        )
    }

    /// Next epoch for a configuration change that keeps the primary.
    pub fn next_configuration(&self) -> Epoch {
        Epoch::from_parts(
            self.data_loss_version,
            self.primary_epoch(),
            self.configuration_number() + 1,
        )
    }

    /// Next epoch for a configuration change that moves the primary.
    pub fn next_primary(&self, increment: i64) -> Epoch {
        Epoch::from_parts(
            self.data_loss_version,
            self.primary_epoch() + increment,
            self.configuration_number() + 1,
        )
    }

    /// Next epoch after data loss has been declared.
    pub fn next_data_loss(&self, primary_increment: i64) -> Epoch {
        Epoch::from_parts(
            self.data_loss_version + 1,
            self.primary_epoch() + primary_increment,
            self.configuration_number() + 1,
        )
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.data_loss_version,
            self.primary_epoch(),
            self.configuration_number()
        )
    }
}
