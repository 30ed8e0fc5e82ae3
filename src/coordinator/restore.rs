//! Restore after data loss

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::artifacts::remove_work_folder;
use super::{CoordinatorInner, WorkFolder};
use crate::archive::unpack_archive;
use crate::coordination::{
    CoordinationError, RestoreLookup, RestoreOperationResult, RestorePointDetails,
};
use crate::error::{BackupRestoreError, Result};
use crate::health::HealthInformation;
use crate::metrics::BackupMetrics;
use crate::retry::{classify_backup_error, classify_coordination_error, classify_io_error};
use crate::utils::paths::ARCHIVE_EXTENSION;

const RESTORE_SUCCESS_MESSAGE: &str = "Partition has been successfully restored.";

impl CoordinatorInner {
    /// Restore the partition if the coordination service has a restore
    /// point for it
    pub(super) async fn on_data_loss(&self, cancellation: CancellationToken) -> Result<bool> {
        let started = Instant::now();
        info!("Data loss reported, checking for a restore point");

        let Some(details) = self.wait_for_restore_point(&cancellation).await? else {
            info!("No restore point and protection not enabled");
            return Ok(false);
        };
        info!(
            operation_id = %details.operation_id,
            backups = details.backup_locations.len(),
            user_initiated = details.user_initiated_operation,
            "Restore point details received"
        );

        let user_initiated = details.user_initiated_operation;
        let restore_folder = self.work_folder(WorkFolder::Restore)?;
        let outcome = self.download_and_restore(&details, &restore_folder, &cancellation).await;
        remove_work_folder(&restore_folder).await;

        info!(
            auto_restored = !user_initiated,
            success = outcome.is_ok(),
            backups = details.backup_locations.len(),
            total_secs = started.elapsed().as_secs_f64(),
            "Restore finished"
        );
        BackupMetrics::record_restore(user_initiated, outcome.is_ok());

        let partition_id = self.partition_id()?;
        match outcome {
            Ok(()) => {
                info!("Partition restored");
                self.report_health(HealthInformation::restore_success(user_initiated, Utc::now()));
                if !user_initiated {
                    return Ok(true);
                }

                let result = RestoreOperationResult {
                    partition_id,
                    operation_id: details.operation_id,
                    timestamp: Utc::now(),
                    error_code: 0,
                    message: Some(RESTORE_SUCCESS_MESSAGE.to_string()),
                };
                match self.report_restore_result(result, &cancellation).await {
                    Ok(()) => {
                        info!("Restore result reported");
                        Ok(true)
                    }
                    Err(e) => {
                        warn!("Reporting restore success failed: {}", e);
                        Ok(false)
                    }
                }
            }
            Err(e) => {
                error!(user_initiated, "Restore failed: {}", e);
                if !user_initiated {
                    self.report_health(HealthInformation::restore_failure(&e));
                    return Err(e);
                }

                let result = RestoreOperationResult {
                    partition_id,
                    operation_id: details.operation_id,
                    timestamp: Utc::now(),
                    error_code: e.error_code(),
                    message: Some(e.to_string()),
                };
                self.report_restore_result(result, &cancellation).await?;
                Ok(true)
            }
        }
    }

    /// Poll until a restore point is available. `None` when protection is
    /// not enabled.
    async fn wait_for_restore_point(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<Option<RestorePointDetails>> {
        let partition = self.backup_partition_info()?;
        loop {
            if cancellation.is_cancelled() {
                return Err(BackupRestoreError::Cancelled);
            }

            match self
                .client
                .get_restore_point_details(&partition, self.config.api_timeout())
                .await
            {
                Ok(RestoreLookup::Pending(details)) => return Ok(Some(details)),
                Ok(RestoreLookup::NotEnabled) => return Ok(None),
                Ok(RestoreLookup::AwaitingRestore) => {
                    info!("Protection enabled, waiting for a restore point")
                }
                Err(CoordinationError::Cancelled) => return Err(BackupRestoreError::Cancelled),
                Err(e) => error!("Fetching restore point details failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.api_retry_interval()) => {}
                _ = cancellation.cancelled() => return Err(BackupRestoreError::Cancelled),
            }
        }
    }

    async fn download_and_restore(
        &self,
        details: &RestorePointDetails,
        restore_folder: &Path,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        tokio::fs::create_dir_all(restore_folder).await?;
        let store = self.store_factory.create(&details.store_information).await?;

        for location in &details.backup_locations {
            let name = location
                .rsplit(['/', '\\'])
                .find(|s| !s.is_empty())
                .ok_or_else(|| {
                    BackupRestoreError::Replica(format!("invalid backup location '{}'", location))
                })?;

            match name.strip_suffix(ARCHIVE_EXTENSION) {
                Some(folder_name) => {
                    let archive = restore_folder.join(name);
                    store.download(location, &archive, true, cancellation).await?;
                    self.unpack(archive, restore_folder.join(folder_name)).await?;
                }
                None => {
                    store
                        .download(location, &restore_folder.join(name), false, cancellation)
                        .await?;
                }
            }
        }
        info!("Downloaded all backups");

        let replica = self.replica.clone();
        let force = details.user_initiated_operation;
        self.retry
            .execute(
                "restore",
                restore_folder.to_path_buf(),
                cancellation,
                classify_backup_error,
                |folder: PathBuf, token| {
                    let replica = replica.clone();
                    async move { replica.restore(&folder, force, token).await }
                },
            )
            .await
    }

    async fn unpack(&self, archive: PathBuf, destination: PathBuf) -> Result<()> {
        let retry = self.retry.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            retry.execute_blocking("unpack_archive", &(), classify_io_error, |_| {
                unpack_archive(&archive, &destination)
            })?;
            retry.execute_blocking("remove_archive", &(), classify_io_error, |_| {
                std::fs::remove_file(&archive)
            })
        })
        .await??;
        Ok(())
    }

    async fn report_restore_result(
        &self,
        result: RestoreOperationResult,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let client = self.client.clone();
        let timeout = self.config.api_timeout();
        self.retry
            .execute(
                "report_restore_operation_result",
                result,
                cancellation,
                classify_coordination_error,
                |result: RestoreOperationResult, _token| {
                    let client = client.clone();
                    async move { client.report_restore_operation_result(&result, timeout).await }
                },
            )
            .await?;
        Ok(())
    }
}
