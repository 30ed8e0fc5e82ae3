//! Policy updates pushed by the coordination service

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::CoordinatorInner;
use crate::error::Result;
use crate::health::HealthInformation;
use crate::metadata::BackupMetadata;
use crate::policy::BackupPolicy;
use crate::utils::TimeoutBudget;

impl CoordinatorInner {
    /// Enable, replace or (with `None`) disable protection
    pub(super) async fn update_scheduling_policy(
        &self,
        policy: Option<BackupPolicy>,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> Result<()> {
        self.ensure_primary()?;
        let budget = TimeoutBudget::start(timeout);
        let partition_id = self.partition_id()?;

        match policy {
            None => {
                info!(%partition_id, "Backup protection disabled");

                if self.live_metadata().is_some() {
                    let record = BackupMetadata::new(partition_id, None);
                    let _permit = self.lock_metadata().await?;
                    self.replica
                        .save_backup_metadata(record.serialize()?, budget.remaining(), cancellation)
                        .await?;
                    self.state.lock().metadata = None;
                } else {
                    self.cancel_initialize().await;
                }

                if let Some(scheduler) = self.state.lock().scheduler.take() {
                    scheduler.stop();
                }
                self.report_health(HealthInformation::clear_backup());
            }
            Some(policy) => {
                let policy = policy.normalized();
                policy.validate()?;
                info!(
                    %partition_id,
                    policy_id = %policy.policy_id,
                    "Backup protection enabled or updated"
                );

                match self.live_metadata() {
                    Some(live) => {
                        let current = live.read().policy.as_ref().map(|p| p.policy_id);
                        if current == Some(policy.policy_id) {
                            return Ok(());
                        }
                    }
                    None => self.cancel_initialize().await,
                }

                if let Some(scheduler) = self.state.lock().scheduler.take() {
                    scheduler.stop();
                }

                let record = BackupMetadata::new(partition_id, Some(policy));
                let bytes = record.serialize()?;
                let metadata = Arc::new(RwLock::new(record));
                {
                    let _permit = self.lock_metadata().await?;
                    self.replica
                        .save_backup_metadata(bytes, budget.remaining(), cancellation)
                        .await?;
                    self.state.lock().metadata = Some(metadata.clone());
                }

                let scheduler = self.new_scheduler(metadata.clone());
                self.install(Some(metadata), Some(scheduler.clone()));
                scheduler.arm(false);
            }
        }

        Ok(())
    }
}
