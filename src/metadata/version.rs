//! Epoch and backup version ordering

use std::fmt;

use serde::{Deserialize, Serialize};

/// Replica set configuration epoch.
///
/// Ordered by data loss number first, then configuration number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Epoch {
    /// Incremented on every data loss
    pub data_loss_number: i64,
    /// Incremented on every reconfiguration
    pub configuration_number: i64,
}

impl Epoch {
    /// Create an epoch
    pub const fn new(data_loss_number: i64, configuration_number: i64) -> Self {
        Self {
            data_loss_number,
            configuration_number,
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.data_loss_number, self.configuration_number)
    }
}

/// Position of a backup in the replication stream: `(Epoch, LSN)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackupVersion {
    /// Epoch of the last record in the backup
    pub epoch: Epoch,
    /// Logical sequence number of the last record in the backup
    pub lsn: i64,
}

impl BackupVersion {
    /// Version of a backup that has not been taken
    pub const INVALID: Self = Self {
        epoch: Epoch::new(-1, -1),
        lsn: -1,
    };

    /// Create a version
    pub const fn new(epoch: Epoch, lsn: i64) -> Self {
        Self { epoch, lsn }
    }

    /// Whether this is a real version
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Default for BackupVersion {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for BackupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.epoch, self.lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_dominates_lsn() {
        let older = BackupVersion::new(Epoch::new(1, 9), 1_000);
        let newer = BackupVersion::new(Epoch::new(2, 0), 5);
        assert!(older < newer);

        let same_epoch = BackupVersion::new(Epoch::new(1, 9), 1_001);
        assert!(older < same_epoch);
    }

    #[test]
    fn configuration_number_breaks_data_loss_ties() {
        assert!(Epoch::new(3, 1) < Epoch::new(3, 2));
        assert!(Epoch::new(3, 7) < Epoch::new(4, 0));
    }

    #[test]
    fn invalid_version_sorts_first() {
        assert!(!BackupVersion::INVALID.is_valid());
        assert!(BackupVersion::INVALID < BackupVersion::new(Epoch::new(0, 0), 0));
        assert_eq!(BackupVersion::default(), BackupVersion::INVALID);
    }
}
