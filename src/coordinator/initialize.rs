//! Primary initialization loop

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::CoordinatorInner;
use crate::coordination::PolicyLookup;
use crate::error::{BackupRestoreError, Result};
use crate::metadata::BackupMetadata;
use crate::replica::{FaultType, PartitionAccessStatus};

/// Poll interval while waiting for write access
pub const WRITE_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(512);

impl CoordinatorInner {
    /// Load or fetch the policy and arm the scheduler, retrying until it
    /// works or the token is cancelled
    pub(super) async fn run_initialize(self: Arc<Self>, cancellation: CancellationToken) {
        loop {
            if cancellation.is_cancelled() {
                return;
            }

            match self.initialize_once(&cancellation).await {
                Ok(()) => return,
                Err(_) if cancellation.is_cancelled() => return,
                Err(e) => error!("Backup initialization failed, retrying: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.api_retry_interval()) => {}
                _ = cancellation.cancelled() => return,
            }
        }
    }

    async fn initialize_once(&self, cancellation: &CancellationToken) -> Result<()> {
        info!("Waiting for write status");
        if !self.wait_for_write_status(cancellation).await? {
            warn!("Unable to acquire write status");
            return Ok(());
        }

        let partition_id = self.partition_id()?;
        let api_timeout = self.config.api_timeout();

        let stored = match self
            .replica
            .get_backup_metadata(api_timeout, cancellation.clone())
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                info!("Reading local backup metadata failed: {}", e);
                None
            }
        };

        let mut found_locally = None;
        if let Some(bytes) = stored {
            let record = BackupMetadata::deserialize(&bytes)?;
            if record.partition_id == partition_id {
                if record.policy.is_none() {
                    info!(%partition_id, "Backup protection is disabled for this partition");
                    self.install(None, None);
                    return Ok(());
                }
                info!(%partition_id, "Backup policy found locally");
                found_locally = Some(record);
            } else {
                info!(
                    %partition_id,
                    stored_partition_id = %record.partition_id,
                    "Local backup metadata belongs to another partition, clearing it"
                );
                self.replica.clear_backup_metadata(api_timeout).await?;
            }
        }

        let policy_found_locally = found_locally.is_some();
        let record = match found_locally {
            Some(record) => record,
            None => {
                let partition = self.backup_partition_info()?;
                info!(%partition_id, "Fetching backup policy from the coordination service");
                let record = match self
                    .client
                    .get_backup_scheduling_policy(&partition, api_timeout)
                    .await?
                {
                    PolicyLookup::Enabled(policy) => {
                        BackupMetadata::new(partition_id, Some(policy.normalized()))
                    }
                    PolicyLookup::NotEnabled => {
                        info!(%partition_id, "Backup protection is not enabled for this partition");
                        BackupMetadata::new(partition_id, None)
                    }
                };

                self.replica
                    .save_backup_metadata(record.serialize()?, api_timeout, cancellation.clone())
                    .await?;

                if record.policy.is_none() {
                    self.install(None, None);
                    return Ok(());
                }
                record
            }
        };

        let metadata = Arc::new(RwLock::new(record));
        let scheduler = self.new_scheduler(metadata.clone());
        self.install(Some(metadata), Some(scheduler.clone()));
        scheduler.arm(policy_found_locally);
        Ok(())
    }

    /// Wait until writes are granted.
    ///
    /// Returns `false` when the replica is not primary or the partition is
    /// gone. An unexpected status error faults the replica.
    async fn wait_for_write_status(&self, cancellation: &CancellationToken) -> Result<bool> {
        let partition = self.partition()?;
        loop {
            if cancellation.is_cancelled() {
                return Err(BackupRestoreError::Cancelled);
            }

            match partition.write_status() {
                Ok(PartitionAccessStatus::Granted) => return Ok(true),
                Ok(PartitionAccessStatus::NotPrimary) => return Ok(false),
                Ok(_) => {}
                Err(BackupRestoreError::ObjectClosed) => return Ok(false),
                Err(e) => {
                    error!("Reading partition write status failed unexpectedly: {}", e);
                    partition.report_fault(FaultType::Transient);
                    return Ok(false);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(WRITE_STATUS_POLL_INTERVAL) => {}
                _ = cancellation.cancelled() => return Err(BackupRestoreError::Cancelled),
            }
        }
    }
}
