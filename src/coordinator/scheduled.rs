//! Timer driven backups

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::artifacts::ChainLink;
use super::CoordinatorInner;
use crate::error::{BackupRestoreError, FailureKind, Result};
use crate::health::HealthInformation;
use crate::metrics::{BackupMetrics, BackupTrigger};
use crate::replica::{BackupCallback, BackupInfo, BackupOption};

impl CoordinatorInner {
    /// Run one scheduled backup and rearm the scheduler from its outcome.
    ///
    /// A broken chain restarts it with one full backup; a full backup that
    /// fails the same way goes through the reschedule backoff.
    pub(super) async fn run_scheduled_backup(self: Arc<Self>, cancellation: CancellationToken) {
        if let Err(e) = self.ensure_primary() {
            warn!("Backup timer fired on a replica that is not primary: {}", e);
            return;
        }

        let Some(metadata) = self.live_metadata() else {
            debug!("Backup timer fired with protection disabled");
            return;
        };
        let (mut option, generation) = {
            let metadata = metadata.read();
            (metadata.next_backup_option(), metadata.policy_update_time)
        };

        loop {
            info!(%option, "Backup timer fired, triggering backup");
            let outcome = self
                .clone()
                .take_scheduled_backup(option, generation, &cancellation)
                .await;
            BackupMetrics::record_backup(BackupTrigger::Scheduled, outcome.is_ok());

            let failed = match outcome {
                Ok(()) => {
                    self.report_health(HealthInformation::backup_success(Utc::now()));
                    false
                }
                Err(e) => match e.failure_kind() {
                    FailureKind::ChainBroken if option != BackupOption::Full => {
                        info!("Backup chain is broken, triggering a full backup: {}", e);
                        option = BackupOption::Full;
                        continue;
                    }
                    FailureKind::NotPrimary => {
                        warn!("Replica is no longer primary, cleaning up: {}", e);
                        self.cleanup();
                        return;
                    }
                    FailureKind::Cancelled => {
                        debug!("Scheduled backup cancelled");
                        return;
                    }
                    FailureKind::NotReadable => {
                        warn!("Replica not readable, rescheduling backup: {}", e);
                        true
                    }
                    _ => {
                        warn!("Scheduled backup failed: {}", e);
                        self.report_health(HealthInformation::backup_failure(&e));
                        true
                    }
                },
            };

            if let Some(scheduler) = self.scheduler() {
                scheduler.rearm(failed);
            }
            return;
        }
    }

    async fn take_scheduled_backup(
        self: Arc<Self>,
        option: BackupOption,
        generation: DateTime<Utc>,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let permit = tokio::select! {
            permit = self.backup_semaphore.acquire() => {
                permit.map_err(|_| BackupRestoreError::ObjectClosed)?
            }
            _ = cancellation.cancelled() => return Err(BackupRestoreError::Cancelled),
        };

        let callback = Arc::new(ScheduledBackupCallback {
            inner: self.clone(),
            generation,
            started: Instant::now(),
        });
        let outcome = self
            .replica
            .backup(option, callback, cancellation.child_token())
            .await;
        drop(permit);
        outcome
    }
}

/// Uploads a scheduled backup and commits it to the live metadata
struct ScheduledBackupCallback {
    inner: Arc<CoordinatorInner>,
    /// Policy update time of the record the backup was started for
    generation: DateTime<Utc>,
    started: Instant,
}

#[async_trait]
impl BackupCallback for ScheduledBackupCallback {
    async fn on_backup_ready(
        &self,
        backup: BackupInfo,
        cancellation: CancellationToken,
    ) -> Result<bool> {
        info!(backup_id = %backup.backup_id, option = %backup.option, "Backup callback fired");
        let inner = &self.inner;
        inner.ensure_primary()?;

        let snapshot = {
            let _permit = inner.lock_metadata().await?;
            inner.live_metadata().map(|m| m.read().clone())
        };
        let Some(mut snapshot) = snapshot else {
            info!("Protection disabled while the backup ran, discarding it");
            return Ok(false);
        };
        if snapshot.policy_update_time != self.generation {
            info!(
                backup_id = %backup.backup_id,
                "Policy changed before the backup was ready, discarding it"
            );
            return Ok(false);
        }
        let Some(policy) = snapshot.policy.clone() else {
            return Ok(false);
        };

        snapshot.verify_chain(&backup)?;
        let (backup_chain_id, parent_backup_id, parent_backup_location) =
            snapshot.chain_for(&backup);

        let properties = inner
            .upload_backup(
                &backup,
                &policy.store_information,
                ChainLink {
                    backup_chain_id,
                    parent_backup_id,
                    parent_backup_location,
                },
                self.started,
                &cancellation,
            )
            .await?;

        snapshot.record_backup(
            &backup,
            backup_chain_id,
            properties.backup_location,
            Utc::now(),
        );

        let _permit = inner.lock_metadata().await?;
        inner.ensure_primary()?;
        let Some(live) = inner.live_metadata() else {
            info!(
                backup_id = %backup.backup_id,
                "Protection disabled while the backup ran, discarding it"
            );
            return Ok(false);
        };
        if live.read().policy_update_time != snapshot.policy_update_time {
            info!(
                backup_id = %backup.backup_id,
                "Policy changed while the backup ran, discarding it"
            );
            return Ok(false);
        }

        inner
            .replica
            .save_backup_metadata(
                snapshot.serialize()?,
                inner.config.api_timeout(),
                cancellation,
            )
            .await?;
        live.write().copy_from(&snapshot);
        Ok(true)
    }
}
