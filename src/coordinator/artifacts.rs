//! Recovery point files, archiving and upload

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::{CoordinatorInner, WorkFolder};
use crate::archive::{directory_size, pack_directory};
use crate::error::{BackupRestoreError, Result};
use crate::metadata::{RecoveryPointMetadataFile, RecoveryPointMetadataProperties};
use crate::metrics::BackupMetrics;
use crate::replica::BackupInfo;
use crate::store::BackupStoreInformation;
use crate::utils::paths::{ARCHIVE_EXTENSION, METADATA_FILE_EXTENSION};
use crate::utils::backup_folder_name;

/// Where a backup sits in its chain
#[derive(Debug, Clone)]
pub(super) struct ChainLink {
    pub backup_chain_id: Uuid,
    pub parent_backup_id: Option<Uuid>,
    pub parent_backup_location: Option<String>,
}

impl ChainLink {
    /// A backup that starts its own chain
    pub fn root(backup_id: Uuid) -> Self {
        Self {
            backup_chain_id: backup_id,
            parent_backup_id: None,
            parent_backup_location: None,
        }
    }
}

impl CoordinatorInner {
    /// Write the recovery point file, optionally archive the backup folder
    /// and upload both. The local working folder is always removed.
    pub(super) async fn upload_backup(
        &self,
        backup: &BackupInfo,
        store_information: &BackupStoreInformation,
        link: ChainLink,
        started: Instant,
        cancellation: &CancellationToken,
    ) -> Result<RecoveryPointMetadataProperties> {
        let work_folder = self.work_folder(WorkFolder::Backup)?;
        let outcome = self
            .upload_backup_in(&work_folder, backup, store_information, link, started, cancellation)
            .await;

        remove_work_folder(&work_folder).await;
        outcome
    }

    async fn upload_backup_in(
        &self,
        work_folder: &Path,
        backup: &BackupInfo,
        store_information: &BackupStoreInformation,
        link: ChainLink,
        started: Instant,
        cancellation: &CancellationToken,
    ) -> Result<RecoveryPointMetadataProperties> {
        let backup_time = Utc::now();
        let folder_name = backup_folder_name(backup_time);
        let relative_path = self.backup_relative_path()?;
        let compress = self.config.enable_compression;
        let backup_location = if compress {
            format!("{}/{}{}", relative_path, folder_name, ARCHIVE_EXTENSION)
        } else {
            format!("{}/{}", relative_path, folder_name)
        };
        let local_backup_secs = started.elapsed().as_secs_f64();

        tokio::fs::create_dir_all(work_folder).await?;

        let metadata_file_name = format!("{}{}", folder_name, METADATA_FILE_EXTENSION);
        let partition_information = self.partition_info()?;
        let partition_id = partition_information.id;
        let properties = RecoveryPointMetadataProperties {
            backup_time,
            backup_id: backup.backup_id,
            parent_backup_id: link.parent_backup_id,
            backup_chain_id: link.backup_chain_id,
            epoch_of_last_backup_record: backup.last_backup_version.epoch,
            lsn_of_last_backup_record: backup.last_backup_version.lsn,
            backup_location: backup_location.clone(),
            parent_backup_location: link.parent_backup_location,
            partition_information,
            service_manifest_version: self.parameters()?.service_manifest_version,
        };
        info!(
            backup_id = %backup.backup_id,
            file = %metadata_file_name,
            "Creating recovery point metadata file"
        );
        let file =
            RecoveryPointMetadataFile::create(work_folder.join(&metadata_file_name), properties)
                .await?;

        if cancellation.is_cancelled() {
            return Err(BackupRestoreError::Cancelled);
        }

        let source = backup.directory.clone();
        let payload_bytes = tokio::task::spawn_blocking(move || directory_size(&source)).await??;

        let (payload, archive_bytes): (PathBuf, u64) = if compress {
            let archive = work_folder.join(format!("{}{}", folder_name, ARCHIVE_EXTENSION));
            let source = backup.directory.clone();
            let target = archive.clone();
            let size =
                tokio::task::spawn_blocking(move || pack_directory(&source, &target)).await??;
            (archive, size)
        } else {
            (backup.directory.clone(), 0)
        };

        info!(
            backup_id = %backup.backup_id,
            location = %backup_location,
            "Uploading backup to store"
        );
        let store = self.store_factory.create(store_information).await?;
        store
            .upload(
                file.path(),
                &format!("{}/{}", relative_path, metadata_file_name),
                true,
                cancellation,
            )
            .await?;
        store.upload(&payload, &backup_location, compress, cancellation).await?;

        let total_secs = started.elapsed().as_secs_f64();
        info!(
            %partition_id,
            option = %backup.option,
            payload_kb = payload_bytes / 1000,
            archive_kb = archive_bytes / 1000,
            local_backup_secs,
            upload_secs = total_secs - local_backup_secs,
            total_secs,
            "Backup uploaded"
        );
        BackupMetrics::record_backup_duration(backup.option, total_secs);

        Ok(file.properties().clone())
    }
}

pub(super) async fn remove_work_folder(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove working folder: {}", e),
    }
}
