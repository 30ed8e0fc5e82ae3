//! Hosting replica and partition contracts
//!
//! The stateful service hosting this agent produces backups, applies
//! restores and stores the agent's metadata blob. Its partition reports
//! write status, faults and health.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::health::HealthInformation;
use crate::metadata::BackupVersion;

/// Kind of backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupOption {
    /// Complete copy of the replica state
    Full,
    /// Changes since the previous backup in the chain
    Incremental,
}

impl BackupOption {
    /// Lower-case label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackupOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backup produced by the replica, handed to the callback before the
/// local folder is discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    /// Local folder holding the backup
    pub directory: PathBuf,
    /// Full or incremental
    pub option: BackupOption,
    /// New identifier for this attempt
    pub backup_id: Uuid,
    /// Parent backup as known by the replica, if it tracks one
    pub parent_backup_id: Option<Uuid>,
    /// Version of the first record in the backup
    pub index_backup_version: BackupVersion,
    /// Version of the last record in the backup
    pub last_backup_version: BackupVersion,
    /// Identifier of the chain's full backup as known by the replica
    pub backup_chain_id: Uuid,
    /// Position in the chain; 0 is the full backup
    pub backup_index: i64,
}

/// Partition key range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionKind {
    /// Single partition service
    Singleton,
    /// Contiguous integer key range
    Int64Range {
        /// Inclusive lower bound
        low_key: i64,
        /// Inclusive upper bound
        high_key: i64,
    },
    /// Named partition
    Named {
        /// Partition name
        name: String,
    },
}

/// Identity of a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Partition identifier
    pub id: Uuid,
    /// Partitioning scheme
    pub kind: PartitionKind,
}

/// Write access of the local replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionAccessStatus {
    /// Writes are accepted
    Granted,
    /// Reconfiguration is in progress
    ReconfigurationPending,
    /// Replica is not primary
    NotPrimary,
    /// Quorum is lost
    NoWriteQuorum,
}

/// Fault raised on the partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// Restart the replica
    Transient,
    /// Rebuild the replica
    Permanent,
}

/// Role of the local replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaRole {
    /// Not yet assigned
    #[default]
    Unknown,
    /// Primary
    Primary,
    /// Active secondary
    ActiveSecondary,
    /// Idle secondary
    IdleSecondary,
    /// Removed from the replica set
    None,
    /// Closed or aborted by the runtime
    Closed,
}

/// Invoked by the replica once a backup is ready on local disk.
///
/// Returning `Ok(false)` tells the replica the backup was not committed.
#[async_trait]
pub trait BackupCallback: Send + Sync {
    /// Upload and record the backup
    async fn on_backup_ready(
        &self,
        backup: BackupInfo,
        cancellation: CancellationToken,
    ) -> Result<bool>;
}

/// Backup/restore operations of the hosting replica
#[async_trait]
pub trait BackupRestoreReplica: Send + Sync {
    /// Take a backup and invoke `callback` with it.
    ///
    /// Errors from the callback are returned unchanged.
    async fn backup(
        &self,
        option: BackupOption,
        callback: Arc<dyn BackupCallback>,
        cancellation: CancellationToken,
    ) -> Result<()>;

    /// Replace the replica state with the backups in `folder`
    async fn restore(
        &self,
        folder: &Path,
        force: bool,
        cancellation: CancellationToken,
    ) -> Result<()>;

    /// Persisted metadata blob, if any
    async fn get_backup_metadata(
        &self,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> Result<Option<Vec<u8>>>;

    /// Persist the metadata blob
    async fn save_backup_metadata(
        &self,
        metadata: Vec<u8>,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> Result<()>;

    /// Remove the persisted metadata blob
    async fn clear_backup_metadata(&self, timeout: Duration) -> Result<()>;
}

/// Partition the replica belongs to
pub trait ServicePartition: Send + Sync {
    /// Partition identity
    fn partition_info(&self) -> PartitionInfo;

    /// Current write access; [`crate::BackupRestoreError::ObjectClosed`]
    /// once the partition has been closed
    fn write_status(&self) -> Result<PartitionAccessStatus>;

    /// Report a fault on the local replica
    fn report_fault(&self, fault: FaultType);

    /// Publish a health report on the partition
    fn report_partition_health(&self, health: HealthInformation) -> Result<()>;
}
