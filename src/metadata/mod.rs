//! Persistent backup bookkeeping
//!
//! [`BackupMetadata`] is the record a primary replica keeps about its
//! protection state: the active policy, when it was assigned and the last
//! recovery point that was successfully uploaded. It is persisted through the
//! hosting replica as an opaque, versioned binary blob.

pub mod recovery_point_file;
pub mod version;

pub use recovery_point_file::{RecoveryPointMetadataFile, RecoveryPointMetadataProperties};
pub use version::{BackupVersion, Epoch};

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::error::BackupRestoreError;
use crate::policy::BackupPolicy;
use crate::replica::{BackupInfo, BackupOption};

/// Current version of the persisted metadata record
pub const BACKUP_METADATA_VERSION: u32 = 1;

const BACKUP_METADATA_MAGIC: &[u8; 4] = b"BKMD";
const ENVELOPE_HEADER_LEN: usize = 8;

/// Metadata encoding errors
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Unsupported metadata version {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid metadata format: {0}")]
    InvalidFormat(String),

    #[error("Metadata checksum mismatch")]
    ChecksumMismatch,

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The last backup that was uploaded and committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPointInformation {
    /// Store relative location of the backup payload
    pub location: String,
    /// Reference time used for the next schedule computation
    pub backup_time: DateTime<Utc>,
    /// Backup identifier
    pub backup_id: Uuid,
    /// Identifier of the full backup that started the chain
    pub backup_chain_id: Uuid,
    /// Position in the chain; 0 is the full backup
    pub backup_index: i64,
}

/// Protection state of a partition replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Record format version
    pub version: u32,
    /// Partition this record belongs to
    pub partition_id: Uuid,
    /// Active policy; `None` means protection is disabled
    pub policy: Option<BackupPolicy>,
    /// When the policy was assigned; used as the commit generation
    pub policy_update_time: DateTime<Utc>,
    /// Last committed recovery point
    pub last_recovery_point: Option<RecoveryPointInformation>,
    /// Backups taken in the current chain, full backup included
    pub number_of_backups_in_chain: u32,
    /// Jitter applied to the last armed timer, not persisted
    #[serde(skip)]
    pub jitter_in_millis_used_in_last_backup: i64,
}

impl BackupMetadata {
    /// Fresh record for a newly assigned (or disabled) policy
    pub fn new(partition_id: Uuid, policy: Option<BackupPolicy>) -> Self {
        Self {
            version: BACKUP_METADATA_VERSION,
            partition_id,
            policy,
            policy_update_time: Utc::now(),
            last_recovery_point: None,
            number_of_backups_in_chain: 0,
            jitter_in_millis_used_in_last_backup: 0,
        }
    }

    /// Overwrite every field with the values of `other`.
    ///
    /// Callers holding a shared handle to this record keep seeing the same
    /// object, only its contents change.
    pub fn copy_from(&mut self, other: &BackupMetadata) {
        self.version = other.version;
        self.partition_id = other.partition_id;
        self.policy = other.policy.clone();
        self.policy_update_time = other.policy_update_time;
        self.last_recovery_point = other.last_recovery_point.clone();
        self.number_of_backups_in_chain = other.number_of_backups_in_chain;
        self.jitter_in_millis_used_in_last_backup = other.jitter_in_millis_used_in_last_backup;
    }

    /// Option for the next scheduled backup: full when the chain is empty
    /// or would exceed the policy's incremental bound.
    pub fn next_backup_option(&self) -> BackupOption {
        let max_incremental = self
            .policy
            .as_ref()
            .map(|p| p.max_incremental_backups)
            .unwrap_or(0);

        let chain = self.number_of_backups_in_chain;
        if chain == 0 || chain > max_incremental {
            BackupOption::Full
        } else {
            BackupOption::Incremental
        }
    }

    /// Check that an incremental backup continues the recorded chain.
    ///
    /// Returns [`BackupRestoreError::MissingFullBackup`] when the declared
    /// parent does not match the last recovery point or, without a declared
    /// parent, when chain id and index are not a direct successor.
    pub fn verify_chain(&self, backup: &BackupInfo) -> Result<(), BackupRestoreError> {
        if backup.option == BackupOption::Full {
            return Ok(());
        }

        let Some(last) = self.last_recovery_point.as_ref() else {
            info!(
                backup_id = %backup.backup_id,
                "Incremental backup without a recorded recovery point"
            );
            return Err(BackupRestoreError::MissingFullBackup);
        };

        let broken = match backup.parent_backup_id {
            Some(parent) => parent != last.backup_id,
            None => {
                last.backup_chain_id != backup.backup_chain_id
                    || last.backup_index + 1 != backup.backup_index
            }
        };

        if broken {
            info!(
                backup_id = %backup.backup_id,
                parent_backup_id = ?backup.parent_backup_id,
                last_backup_id = %last.backup_id,
                backup_chain_id = %backup.backup_chain_id,
                last_backup_chain_id = %last.backup_chain_id,
                backup_index = backup.backup_index,
                last_backup_index = last.backup_index,
                "Backup chain is broken"
            );
            return Err(BackupRestoreError::MissingFullBackup);
        }

        Ok(())
    }

    /// Chain id and parent information to record for `backup`
    pub fn chain_for(&self, backup: &BackupInfo) -> (Uuid, Option<Uuid>, Option<String>) {
        match (backup.option, self.last_recovery_point.as_ref()) {
            (BackupOption::Incremental, Some(last)) => {
                (last.backup_chain_id, Some(last.backup_id), Some(last.location.clone()))
            }
            _ => (backup.backup_id, None, None),
        }
    }

    /// Record a completed backup.
    ///
    /// When the timer fired early because of negative jitter the reference
    /// time is pushed past the planned instant so the next computation does
    /// not land on the same slot again.
    pub fn record_backup(
        &mut self,
        backup: &BackupInfo,
        backup_chain_id: Uuid,
        location: String,
        completed_at: DateTime<Utc>,
    ) {
        match backup.option {
            BackupOption::Incremental => self.number_of_backups_in_chain += 1,
            BackupOption::Full => self.number_of_backups_in_chain = 1,
        }

        let mut backup_time = completed_at;
        if self.jitter_in_millis_used_in_last_backup < 0 {
            let early_by = self.jitter_in_millis_used_in_last_backup.abs();
            backup_time += ChronoDuration::milliseconds(early_by + 1000);
        }
        self.jitter_in_millis_used_in_last_backup = 0;

        self.last_recovery_point = Some(RecoveryPointInformation {
            location,
            backup_time,
            backup_id: backup.backup_id,
            backup_chain_id,
            backup_index: backup.backup_index,
        });
    }

    /// Encode as `magic | version (u32 LE) | payload`
    pub fn serialize(&self) -> Result<Vec<u8>, MetadataError> {
        let payload = bincode::serialize(self)?;
        let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
        buf.put_slice(BACKUP_METADATA_MAGIC);
        buf.put_u32_le(self.version);
        buf.put_slice(&payload);
        Ok(buf.to_vec())
    }

    /// Decode a record produced by [`BackupMetadata::serialize`].
    ///
    /// Versions newer than this build understands are rejected.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, MetadataError> {
        if bytes.len() < ENVELOPE_HEADER_LEN {
            return Err(MetadataError::InvalidFormat(format!(
                "record of {} bytes is shorter than the header",
                bytes.len()
            )));
        }

        let mut header = &bytes[..ENVELOPE_HEADER_LEN];
        let mut magic = [0u8; 4];
        header.copy_to_slice(&mut magic);
        if &magic != BACKUP_METADATA_MAGIC {
            return Err(MetadataError::InvalidFormat("bad magic".into()));
        }

        let version = header.get_u32_le();
        if version != BACKUP_METADATA_VERSION {
            return Err(MetadataError::UnsupportedVersion(version));
        }

        let metadata: BackupMetadata = bincode::deserialize(&bytes[ENVELOPE_HEADER_LEN..])?;
        if metadata.version != version {
            return Err(MetadataError::InvalidFormat(format!(
                "header version {} does not match record version {}",
                version, metadata.version
            )));
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{BackupSchedule, FrequencyInterval};
    use crate::store::BackupStoreInformation;
    use std::path::PathBuf;

    fn policy(max_incremental_backups: u32) -> BackupPolicy {
        BackupPolicy::new(
            "hourly",
            BackupSchedule::Frequency { interval: FrequencyInterval::Hours(1) },
            max_incremental_backups,
            BackupStoreInformation::FileShare { path: PathBuf::from("/mnt/backups") },
        )
    }

    fn backup(option: BackupOption, index: i64, chain: Uuid, parent: Option<Uuid>) -> BackupInfo {
        BackupInfo {
            directory: PathBuf::from("/tmp/b"),
            option,
            backup_id: Uuid::new_v4(),
            parent_backup_id: parent,
            index_backup_version: BackupVersion::INVALID,
            last_backup_version: BackupVersion::new(Epoch::new(1, 1), 10 + index),
            backup_chain_id: chain,
            backup_index: index,
        }
    }

    #[test]
    fn chain_count_follows_full_then_incrementals() {
        let mut metadata = BackupMetadata::new(Uuid::new_v4(), Some(policy(3)));
        assert_eq!(metadata.next_backup_option(), BackupOption::Full);

        let full = backup(BackupOption::Full, 0, Uuid::nil(), None);
        let chain = full.backup_id;
        metadata.record_backup(&full, chain, "p/0.tgz".into(), Utc::now());
        assert_eq!(metadata.number_of_backups_in_chain, 1);

        let mut parent = full.backup_id;
        for index in 1..=3 {
            assert_eq!(metadata.next_backup_option(), BackupOption::Incremental);
            let inc = backup(BackupOption::Incremental, index, chain, Some(parent));
            metadata.verify_chain(&inc).unwrap();
            metadata.record_backup(&inc, chain, format!("p/{index}.tgz"), Utc::now());
            parent = inc.backup_id;
        }
        assert_eq!(metadata.number_of_backups_in_chain, 4);
        assert_eq!(metadata.next_backup_option(), BackupOption::Full);

        let full = backup(BackupOption::Full, 0, Uuid::nil(), None);
        metadata.record_backup(&full, full.backup_id, "p/x.tgz".into(), Utc::now());
        assert_eq!(metadata.number_of_backups_in_chain, 1);
    }

    #[test]
    fn parent_mismatch_breaks_chain() {
        let mut metadata = BackupMetadata::new(Uuid::new_v4(), Some(policy(5)));
        let full = backup(BackupOption::Full, 0, Uuid::nil(), None);
        metadata.record_backup(&full, full.backup_id, "p/0.tgz".into(), Utc::now());

        let orphan = backup(BackupOption::Incremental, 1, full.backup_id, Some(Uuid::new_v4()));
        assert!(matches!(
            metadata.verify_chain(&orphan),
            Err(BackupRestoreError::MissingFullBackup)
        ));
    }

    #[test]
    fn index_gap_breaks_chain_without_parent() {
        let mut metadata = BackupMetadata::new(Uuid::new_v4(), Some(policy(5)));
        let full = backup(BackupOption::Full, 0, Uuid::nil(), None);
        metadata.record_backup(&full, full.backup_id, "p/0.tgz".into(), Utc::now());

        let contiguous = backup(BackupOption::Incremental, 1, full.backup_id, None);
        assert!(metadata.verify_chain(&contiguous).is_ok());

        let gap = backup(BackupOption::Incremental, 2, full.backup_id, None);
        assert!(metadata.verify_chain(&gap).is_err());

        let other_chain = backup(BackupOption::Incremental, 1, Uuid::new_v4(), None);
        assert!(metadata.verify_chain(&other_chain).is_err());
    }

    #[test]
    fn incremental_without_history_is_broken() {
        let metadata = BackupMetadata::new(Uuid::new_v4(), Some(policy(5)));
        let inc = backup(BackupOption::Incremental, 1, Uuid::new_v4(), None);
        assert!(metadata.verify_chain(&inc).is_err());
    }

    #[test]
    fn negative_jitter_pushes_recovery_point_forward() {
        let mut metadata = BackupMetadata::new(Uuid::new_v4(), Some(policy(5)));
        metadata.jitter_in_millis_used_in_last_backup = -4_000;
        let completed = Utc::now();
        let full = backup(BackupOption::Full, 0, Uuid::nil(), None);
        metadata.record_backup(&full, full.backup_id, "p/0.tgz".into(), completed);

        let rp = metadata.last_recovery_point.as_ref().unwrap();
        assert_eq!(rp.backup_time, completed + ChronoDuration::milliseconds(5_000));
        assert_eq!(metadata.jitter_in_millis_used_in_last_backup, 0);
    }

    #[test]
    fn codec_preserves_record_but_not_jitter() {
        let mut metadata = BackupMetadata::new(Uuid::new_v4(), Some(policy(2)));
        metadata.jitter_in_millis_used_in_last_backup = 1234;
        let full = backup(BackupOption::Full, 0, Uuid::nil(), None);
        let location = "app/svc/p/2024-01-01 00.00.00.tgz".to_string();
        metadata.record_backup(&full, full.backup_id, location, Utc::now());
        metadata.jitter_in_millis_used_in_last_backup = 1234;

        let decoded = BackupMetadata::deserialize(&metadata.serialize().unwrap()).unwrap();
        assert_eq!(decoded.jitter_in_millis_used_in_last_backup, 0);
        metadata.jitter_in_millis_used_in_last_backup = 0;
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn unknown_version_fails_loudly() {
        let metadata = BackupMetadata::new(Uuid::new_v4(), None);
        let mut bytes = metadata.serialize().unwrap();
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            BackupMetadata::deserialize(&bytes),
            Err(MetadataError::UnsupportedVersion(7))
        ));

        assert!(matches!(
            BackupMetadata::deserialize(b"NOPE\x01\x00\x00\x00"),
            Err(MetadataError::InvalidFormat(_))
        ));
    }

    #[test]
    fn copy_from_overwrites_in_place() {
        let mut live = BackupMetadata::new(Uuid::new_v4(), Some(policy(1)));
        let mut working = live.clone();
        working.number_of_backups_in_chain = 9;
        working.jitter_in_millis_used_in_last_backup = -5;
        live.copy_from(&working);
        assert_eq!(live, working);
    }
}
