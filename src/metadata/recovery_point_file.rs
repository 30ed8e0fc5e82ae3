//! Recovery point metadata file
//!
//! A small file uploaded next to every backup payload describing where the
//! backup sits in its chain. Layout:
//!
//! ```text
//! +----------------------+---------------------------------------------+
//! | properties (bincode) | footer: magic | version | offset | length | sha256 |
//! +----------------------+---------------------------------------------+
//! ```

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use super::{Epoch, MetadataError};
use crate::replica::PartitionInfo;

/// Current version of the recovery point metadata file
pub const RECOVERY_POINT_FILE_VERSION: u32 = 1;

const FOOTER_MAGIC: &[u8; 4] = b"RPMF";
const FOOTER_LEN: usize = 4 + 4 + 8 + 8 + 32;

/// Properties recorded for one uploaded backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPointMetadataProperties {
    /// When the backup was taken
    pub backup_time: DateTime<Utc>,
    /// Backup identifier
    pub backup_id: Uuid,
    /// Parent backup, absent for a full backup
    pub parent_backup_id: Option<Uuid>,
    /// Identifier of the chain's full backup
    pub backup_chain_id: Uuid,
    /// Epoch of the last record in the backup
    pub epoch_of_last_backup_record: Epoch,
    /// LSN of the last record in the backup
    pub lsn_of_last_backup_record: i64,
    /// Store relative location of the payload
    pub backup_location: String,
    /// Store relative location of the parent payload
    pub parent_backup_location: Option<String>,
    /// Partition the backup was taken from
    pub partition_information: PartitionInfo,
    /// Version of the service manifest that produced the backup
    pub service_manifest_version: String,
}

/// Handle to a recovery point metadata file on disk
#[derive(Debug, Clone)]
pub struct RecoveryPointMetadataFile {
    path: PathBuf,
    properties: RecoveryPointMetadataProperties,
}

impl RecoveryPointMetadataFile {
    /// Write a new metadata file at `path`, replacing any existing file
    pub async fn create(
        path: impl AsRef<Path>,
        properties: RecoveryPointMetadataProperties,
    ) -> Result<Self, MetadataError> {
        let path = path.as_ref().to_path_buf();
        let bytes = Self::encode(&properties)?;

        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;

        debug!(
            path = %path.display(),
            backup_id = %properties.backup_id,
            "Wrote recovery point metadata file"
        );
        Ok(Self { path, properties })
    }

    /// Read and verify an existing metadata file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let path = path.as_ref().to_path_buf();
        let bytes = tokio::fs::read(&path).await?;
        let properties = Self::decode(&bytes)?;
        Ok(Self { path, properties })
    }

    /// Location of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recorded properties
    pub fn properties(&self) -> &RecoveryPointMetadataProperties {
        &self.properties
    }

    /// Backup identifier
    pub fn backup_id(&self) -> Uuid {
        self.properties.backup_id
    }

    /// Store relative payload location
    pub fn backup_location(&self) -> &str {
        &self.properties.backup_location
    }

    fn encode(properties: &RecoveryPointMetadataProperties) -> Result<Vec<u8>, MetadataError> {
        let block = bincode::serialize(properties)?;
        let checksum = Sha256::digest(&block);

        let mut buf = BytesMut::with_capacity(block.len() + FOOTER_LEN);
        buf.put_slice(&block);
        buf.put_slice(FOOTER_MAGIC);
        buf.put_u32_le(RECOVERY_POINT_FILE_VERSION);
        buf.put_u64_le(0);
        buf.put_u64_le(block.len() as u64);
        buf.put_slice(&checksum);
        Ok(buf.to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<RecoveryPointMetadataProperties, MetadataError> {
        if bytes.len() < FOOTER_LEN {
            return Err(MetadataError::InvalidFormat("file is shorter than the footer".into()));
        }

        let mut footer = &bytes[bytes.len() - FOOTER_LEN..];
        let mut magic = [0u8; 4];
        footer.copy_to_slice(&mut magic);
        if &magic != FOOTER_MAGIC {
            return Err(MetadataError::InvalidFormat("bad footer magic".into()));
        }

        let version = footer.get_u32_le();
        if version != RECOVERY_POINT_FILE_VERSION {
            return Err(MetadataError::UnsupportedVersion(version));
        }

        let offset = footer.get_u64_le() as usize;
        let length = footer.get_u64_le() as usize;
        let body_end = bytes.len() - FOOTER_LEN;
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= body_end)
            .ok_or_else(|| MetadataError::InvalidFormat("properties block out of range".into()))?;

        let block = &bytes[offset..end];
        if Sha256::digest(block).as_slice() != footer.chunk() {
            return Err(MetadataError::ChecksumMismatch);
        }

        Ok(bincode::deserialize(block)?)
    }
}
