//! Coordination service contract
//!
//! The coordination service owns policy assignment and restore requests.
//! The agent pulls policies and restore points from it, pushes operation
//! results back, and registers a [`BackupRestoreHandler`] through which the
//! service pushes policy changes and on-demand backup requests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metadata::Epoch;
use crate::policy::BackupPolicy;
use crate::retry::CancellableError;
use crate::store::BackupStoreInformation;

/// Coordination service errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("Coordination service call timed out")]
    Timeout,

    #[error("Coordination service unavailable: {0}")]
    Unavailable(String),

    #[error("Coordination service rejected the request ({code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("Coordination service call cancelled")]
    Cancelled,
}

impl CoordinationError {
    /// Whether retrying the call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}

impl CancellableError for CoordinationError {
    fn cancelled() -> Self {
        Self::Cancelled
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Partition identity sent with every request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPartitionInfo {
    /// Partition identifier
    pub partition_id: Uuid,
    /// Service name URI
    pub service_name: String,
}

/// Answer to a policy lookup
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyLookup {
    /// Periodic backup is enabled with this policy
    Enabled(BackupPolicy),
    /// Periodic backup is not enabled for the partition
    NotEnabled,
}

/// Answer to a restore point lookup
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreLookup {
    /// A restore is pending
    Pending(RestorePointDetails),
    /// Protection is enabled but no restore has been requested yet
    AwaitingRestore,
    /// Nothing to restore
    NotEnabled,
}

/// Backups to restore after data loss
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePointDetails {
    /// Restore operation identifier
    pub operation_id: Uuid,
    /// Store relative locations, full backup first
    pub backup_locations: Vec<String>,
    /// Store holding the backups
    pub store_information: BackupStoreInformation,
    /// Whether a user requested the restore
    pub user_initiated_operation: bool,
}

/// On-demand backup request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupNowConfiguration {
    /// Store to upload to
    pub store_information: BackupStoreInformation,
    /// Budget for taking and uploading the backup
    pub operation_timeout: Duration,
}

/// Outcome of an on-demand backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOperationResult {
    /// Partition identifier
    pub partition_id: Uuid,
    /// Operation identifier supplied with the request
    pub operation_id: Uuid,
    /// When the result was produced
    pub timestamp: DateTime<Utc>,
    /// 0 on success
    pub error_code: i32,
    /// Failure description
    pub message: Option<String>,
    /// Identifier of the uploaded backup
    pub backup_id: Option<Uuid>,
    /// Store relative location of the uploaded backup
    pub backup_location: Option<String>,
    /// When the backup was taken
    pub backup_time: Option<DateTime<Utc>>,
    /// Epoch of the last backed up record
    pub epoch_of_last_backup_record: Option<Epoch>,
    /// LSN of the last backed up record
    pub lsn_of_last_backup_record: Option<i64>,
}

/// Outcome of a restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOperationResult {
    /// Partition identifier
    pub partition_id: Uuid,
    /// Restore operation identifier
    pub operation_id: Uuid,
    /// When the result was produced
    pub timestamp: DateTime<Utc>,
    /// 0 on success
    pub error_code: i32,
    /// Failure description
    pub message: Option<String>,
}

/// Requests the coordination service pushes to a registered primary
#[async_trait]
pub trait BackupRestoreHandler: Send + Sync {
    /// A new policy was assigned, or protection was disabled with `None`
    async fn update_backup_scheduling_policy(
        &self,
        policy: Option<BackupPolicy>,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> crate::Result<()>;

    /// Take an on-demand backup
    async fn backup_partition(
        &self,
        operation_id: Uuid,
        configuration: BackupNowConfiguration,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> crate::Result<()>;
}

/// Client of the coordination service
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Policy assigned to the partition
    async fn get_backup_scheduling_policy(
        &self,
        partition: &BackupPartitionInfo,
        timeout: Duration,
    ) -> Result<PolicyLookup, CoordinationError>;

    /// Pending restore for the partition
    async fn get_restore_point_details(
        &self,
        partition: &BackupPartitionInfo,
        timeout: Duration,
    ) -> Result<RestoreLookup, CoordinationError>;

    /// Report the outcome of an on-demand backup
    async fn report_backup_operation_result(
        &self,
        result: &BackupOperationResult,
        timeout: Duration,
    ) -> Result<(), CoordinationError>;

    /// Report the outcome of a restore
    async fn report_restore_operation_result(
        &self,
        result: &RestoreOperationResult,
        timeout: Duration,
    ) -> Result<(), CoordinationError>;

    /// Route pushed requests for the replica to `handler`
    fn register_replica(
        &self,
        partition_id: Uuid,
        replica_id: i64,
        handler: Arc<dyn BackupRestoreHandler>,
    ) -> Result<(), CoordinationError>;

    /// Stop routing requests to the replica
    fn unregister_replica(
        &self,
        partition_id: Uuid,
        replica_id: i64,
    ) -> Result<(), CoordinationError>;
}
