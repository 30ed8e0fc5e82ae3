//! On-demand ("backup now") backups

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::artifacts::ChainLink;
use super::{BackgroundTask, CoordinatorInner, OnDemandBackup};
use crate::coordination::{BackupNowConfiguration, BackupOperationResult};
use crate::error::{BackupRestoreError, Result};
use crate::metadata::RecoveryPointMetadataProperties;
use crate::metrics::{BackupMetrics, BackupTrigger};
use crate::replica::{BackupCallback, BackupInfo, BackupOption};

const SUCCESS_MESSAGE: &str = "Partition successfully backed up.";

impl CoordinatorInner {
    /// Start an on-demand backup unless one is already in flight.
    ///
    /// Repeating the latest operation id is a no-op, whether or not it has
    /// finished. A different id is rejected with
    /// [`BackupRestoreError::BackupInProgress`] while a backup is in flight.
    pub(super) fn backup_partition(
        &self,
        operation_id: Uuid,
        configuration: BackupNowConfiguration,
    ) -> Result<()> {
        info!(%operation_id, "On-demand backup requested");
        self.ensure_primary()?;

        let mut slot = self.on_demand.lock();
        if let Some(current) = slot.as_ref() {
            if current.operation_id == operation_id {
                info!(%operation_id, "Duplicate on-demand backup request, ignoring");
                return Ok(());
            }
        }
        if let Some(current) = slot.as_ref().filter(|b| !b.finished) {
            warn!(
                %operation_id,
                current_operation_id = %current.operation_id,
                "Rejecting on-demand backup, another one is in progress"
            );
            return Err(BackupRestoreError::BackupInProgress(current.operation_id));
        }

        let Some(inner) = self.weak_self.upgrade() else {
            return Err(BackupRestoreError::ObjectClosed);
        };
        let token = CancellationToken::new();
        let handle = self
            .handle
            .spawn(inner.run_on_demand_backup(operation_id, configuration, token.clone()));
        *slot = Some(OnDemandBackup {
            operation_id,
            task: Some(BackgroundTask { token, handle }),
            finished: false,
        });
        Ok(())
    }

    async fn run_on_demand_backup(
        self: Arc<Self>,
        operation_id: Uuid,
        configuration: BackupNowConfiguration,
        cancellation: CancellationToken,
    ) {
        let timeout = configuration.operation_timeout;
        let backup_token = cancellation.child_token();
        let attempt = tokio::time::timeout(
            timeout,
            self.clone()
                .take_on_demand_backup(operation_id, configuration, backup_token.clone()),
        )
        .await;
        let outcome = attempt.unwrap_or_else(|_| {
            backup_token.cancel();
            Err(BackupRestoreError::Timeout(format!(
                "on-demand backup {} did not finish within {:?}",
                operation_id, timeout
            )))
        });

        if cancellation.is_cancelled() {
            info!(%operation_id, "On-demand backup cancelled, not reporting a result");
            self.finish_on_demand(operation_id);
            return;
        }
        BackupMetrics::record_backup(BackupTrigger::OnDemand, outcome.is_ok());

        let result = match self.on_demand_result(operation_id, outcome) {
            Ok(result) => result,
            Err(e) => {
                warn!(%operation_id, "Cannot build the on-demand backup result: {}", e);
                self.finish_on_demand(operation_id);
                return;
            }
        };

        info!(%operation_id, "Reporting on-demand backup result");
        loop {
            match self
                .client
                .report_backup_operation_result(&result, self.config.api_timeout())
                .await
            {
                Ok(()) => break,
                Err(e) => warn!(%operation_id, "Reporting on-demand backup result failed: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.api_retry_interval()) => {}
                _ = cancellation.cancelled() => break,
            }
        }

        info!(%operation_id, "On-demand backup operation completed");
        self.finish_on_demand(operation_id);
    }

    async fn take_on_demand_backup(
        self: Arc<Self>,
        operation_id: Uuid,
        configuration: BackupNowConfiguration,
        cancellation: CancellationToken,
    ) -> Result<RecoveryPointMetadataProperties> {
        let permit = tokio::select! {
            permit = self.backup_semaphore.acquire() => {
                permit.map_err(|_| BackupRestoreError::ObjectClosed)?
            }
            _ = cancellation.cancelled() => return Err(BackupRestoreError::Cancelled),
        };

        info!(%operation_id, "Taking on-demand backup");
        let callback = Arc::new(OnDemandBackupCallback {
            inner: self.clone(),
            store_information: configuration.store_information,
            started: Instant::now(),
            properties: Mutex::new(None),
        });
        let outcome = self
            .replica
            .backup(BackupOption::Full, callback.clone(), cancellation)
            .await;
        drop(permit);
        outcome?;

        let properties = callback.properties.lock().take();
        properties.ok_or_else(|| {
            BackupRestoreError::Replica(
                "backup finished without invoking the backup callback".into(),
            )
        })
    }

    fn on_demand_result(
        &self,
        operation_id: Uuid,
        outcome: Result<RecoveryPointMetadataProperties>,
    ) -> Result<BackupOperationResult> {
        let partition_id = self.partition_id()?;
        let result = match outcome {
            Ok(properties) => BackupOperationResult {
                partition_id,
                operation_id,
                timestamp: properties.backup_time,
                error_code: 0,
                message: Some(SUCCESS_MESSAGE.to_string()),
                backup_id: Some(properties.backup_id),
                backup_location: Some(properties.backup_location),
                backup_time: Some(properties.backup_time),
                epoch_of_last_backup_record: Some(properties.epoch_of_last_backup_record),
                lsn_of_last_backup_record: Some(properties.lsn_of_last_backup_record),
            },
            Err(e) => {
                warn!(%operation_id, "On-demand backup failed: {}", e);
                BackupOperationResult {
                    partition_id,
                    operation_id,
                    timestamp: Utc::now(),
                    error_code: e.error_code(),
                    message: Some(e.to_string()),
                    backup_id: None,
                    backup_location: None,
                    backup_time: None,
                    epoch_of_last_backup_record: None,
                    lsn_of_last_backup_record: None,
                }
            }
        };
        Ok(result)
    }

    fn finish_on_demand(&self, operation_id: Uuid) {
        let mut slot = self.on_demand.lock();
        if let Some(current) = slot.as_mut().filter(|b| b.operation_id == operation_id) {
            current.finished = true;
            current.task = None;
        }
    }
}

/// Uploads an on-demand backup and restarts the scheduled chain
struct OnDemandBackupCallback {
    inner: Arc<CoordinatorInner>,
    store_information: crate::store::BackupStoreInformation,
    started: Instant,
    properties: Mutex<Option<RecoveryPointMetadataProperties>>,
}

#[async_trait]
impl BackupCallback for OnDemandBackupCallback {
    async fn on_backup_ready(
        &self,
        backup: BackupInfo,
        cancellation: CancellationToken,
    ) -> Result<bool> {
        info!(backup_id = %backup.backup_id, "On-demand backup callback fired");
        let inner = &self.inner;
        inner.ensure_primary()?;

        let properties = inner
            .upload_backup(
                &backup,
                &self.store_information,
                ChainLink::root(backup.backup_id),
                self.started,
                &cancellation,
            )
            .await?;

        {
            let _permit = inner.lock_metadata().await?;
            inner.ensure_primary()?;
            if let Some(live) = inner.live_metadata() {
                let bytes = {
                    let mut metadata = live.write();
                    metadata.number_of_backups_in_chain = 0;
                    metadata.serialize()?
                };
                inner
                    .replica
                    .save_backup_metadata(bytes, inner.config.api_timeout(), cancellation)
                    .await?;
            }
        }

        *self.properties.lock() = Some(properties);
        Ok(true)
    }
}
