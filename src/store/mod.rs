//! Artifact stores
//!
//! Backups are uploaded to, and restored from, one of a closed set of
//! stores selected by [`BackupStoreInformation`]. Every store call retries
//! transient failures internally and creates intermediate directories or
//! prefixes as needed.

pub mod cloud;
pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

pub use cloud::{CloudBlobStore, ObjectClient};
pub use local::LocalFileShareStore;
pub use memory::MemoryObjectClient;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::BackupRestoreConfig;
use crate::retry::{is_retryable_io, CancellableError, RetryConfig};

/// Artifact store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Path too long: {0}")]
    PathTooLong(String),

    #[error("Access denied: {0}")]
    Unauthorized(String),

    #[error("Invalid remote path: {0}")]
    InvalidPath(String),

    #[error("Transient store failure: {0}")]
    Transient(String),

    #[error("Store rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported store: {0}")]
    Unsupported(String),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// Whether retrying the call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Timeout(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::Io(e) => e.kind() != std::io::ErrorKind::NotFound && is_retryable_io(e),
            _ => false,
        }
    }

    /// Map a local filesystem error onto the store taxonomy
    pub fn from_io(err: std::io::Error, path: &Path) -> Self {
        #[cfg(unix)]
        const NAME_TOO_LONG: i32 = 36;
        #[cfg(windows)]
        const NAME_TOO_LONG: i32 = 206;
        #[cfg(not(any(unix, windows)))]
        const NAME_TOO_LONG: i32 = -1;

        if err.raw_os_error() == Some(NAME_TOO_LONG) {
            return Self::PathTooLong(path.display().to_string());
        }
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.display().to_string()),
            std::io::ErrorKind::PermissionDenied => Self::Unauthorized(path.display().to_string()),
            _ => Self::Io(err),
        }
    }
}

impl CancellableError for StoreError {
    fn cancelled() -> Self {
        Self::Cancelled
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Where backups of a policy are stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStoreInformation {
    /// Local or mounted file share
    FileShare {
        /// Root folder of the share
        path: PathBuf,
    },
    /// Object storage with explicit credentials
    CloudBlob {
        /// Bucket or container name
        container: String,
        /// Region of the bucket
        region: String,
        /// Custom endpoint for S3 compatible services
        endpoint_url: Option<String>,
        /// Access key id
        access_key_id: String,
        /// Secret access key
        secret_access_key: String,
        /// Use path style addressing
        force_path_style: bool,
    },
    /// Object storage with credentials from the ambient provider chain
    DelegatedCloudBlob {
        /// Bucket or container name
        container: String,
        /// Region of the bucket
        region: String,
        /// Custom endpoint for S3 compatible services
        endpoint_url: Option<String>,
    },
}

impl BackupStoreInformation {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileShare { .. } => "file_share",
            Self::CloudBlob { .. } => "cloud_blob",
            Self::DelegatedCloudBlob { .. } => "delegated_cloud_blob",
        }
    }
}

/// Upload/download of backup artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload a file to `remote_path`, or the contents of a directory
    /// under the `remote_path` folder when `is_file` is false.
    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        is_file: bool,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Download the file at `remote_path` to `local_path`, or every file
    /// under the `remote_path` folder into the `local_path` directory.
    async fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        is_file: bool,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError>;
}

/// Split a store relative path into validated segments
pub(crate) fn remote_segments(remote_path: &str) -> Result<Vec<&str>, StoreError> {
    let segments: Vec<&str> = remote_path
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();

    if segments.is_empty() || segments.contains(&"..") {
        return Err(StoreError::InvalidPath(remote_path.to_string()));
    }
    Ok(segments)
}

/// Builds artifact stores from policy store information
#[derive(Clone)]
pub struct StoreFactory {
    retry: RetryConfig,
    timeout: Duration,
    object_client: Option<Arc<dyn ObjectClient>>,
}

impl StoreFactory {
    /// Factory using the agent's retry and store timeout settings
    pub fn new(config: &BackupRestoreConfig) -> Self {
        Self {
            retry: RetryConfig::from_config(config),
            timeout: config.store_api_timeout(),
            object_client: None,
        }
    }

    /// Route every cloud variant through the given object client
    pub fn with_object_client(mut self, client: Arc<dyn ObjectClient>) -> Self {
        self.object_client = Some(client);
        self
    }

    /// Build the store for `info`
    pub async fn create(
        &self,
        info: &BackupStoreInformation,
    ) -> Result<Arc<dyn ArtifactStore>, StoreError> {
        match info {
            BackupStoreInformation::FileShare { path } => Ok(Arc::new(LocalFileShareStore::new(
                path.clone(),
                self.retry.clone(),
                self.timeout,
            ))),
            BackupStoreInformation::CloudBlob { container, .. }
            | BackupStoreInformation::DelegatedCloudBlob { container, .. } => {
                let client = match &self.object_client {
                    Some(client) => client.clone(),
                    None => Self::object_client_for(info).await?,
                };
                Ok(Arc::new(CloudBlobStore::new(
                    client,
                    container.clone(),
                    self.retry.clone(),
                    self.timeout,
                )))
            }
        }
    }

    #[cfg(feature = "s3")]
    async fn object_client_for(
        info: &BackupStoreInformation,
    ) -> Result<Arc<dyn ObjectClient>, StoreError> {
        Ok(Arc::new(s3::S3ObjectClient::from_store_information(info).await?))
    }

    #[cfg(not(feature = "s3"))]
    async fn object_client_for(
        info: &BackupStoreInformation,
    ) -> Result<Arc<dyn ObjectClient>, StoreError> {
        Err(StoreError::Unsupported(format!(
            "{} stores require the `s3` feature",
            info.kind()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_classification() {
        assert!(StoreError::Transient("503".into()).is_transient());
        assert!(StoreError::Rejected { status: 502, message: "bad gateway".into() }.is_transient());
        assert!(!StoreError::Rejected { status: 404, message: "missing".into() }.is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        assert!(!StoreError::Unauthorized("x".into()).is_transient());
        assert!(!StoreError::PathTooLong("x".into()).is_transient());
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(StoreError::Io(reset).is_transient());
        let gone = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(!StoreError::Io(gone).is_transient());
    }

    #[test]
    fn io_errors_map_to_store_errors() {
        let path = Path::new("/share/a");
        let err = StoreError::from_io(std::io::Error::new(std::io::ErrorKind::NotFound, "x"), path);
        assert!(matches!(err, StoreError::NotFound(_)));
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "x");
        let err = StoreError::from_io(denied, path);
        assert!(matches!(err, StoreError::Unauthorized(_)));
    }

    #[test]
    fn remote_paths_are_validated() {
        assert_eq!(remote_segments("app/svc//p/x.tgz").unwrap(), vec!["app", "svc", "p", "x.tgz"]);
        assert!(remote_segments("../etc").is_err());
        assert!(remote_segments("").is_err());
    }

    #[tokio::test]
    async fn cloud_store_without_client_is_unsupported_by_default() {
        let factory = StoreFactory::new(&BackupRestoreConfig::default());
        let info = BackupStoreInformation::DelegatedCloudBlob {
            container: "backups".into(),
            region: "us-east-1".into(),
            endpoint_url: None,
        };
        let result = factory.create(&info).await;
        if cfg!(not(feature = "s3")) {
            assert!(matches!(result, Err(StoreError::Unsupported(_))));
        }
    }

    #[tokio::test]
    async fn injected_object_client_serves_cloud_variants() {
        let client = Arc::new(MemoryObjectClient::new());
        let factory = StoreFactory::new(&BackupRestoreConfig::default()).with_object_client(client);
        let info = BackupStoreInformation::CloudBlob {
            container: "backups".into(),
            region: "us-east-1".into(),
            endpoint_url: Some("http://localhost:9000".into()),
            access_key_id: "key".into(),
            secret_access_key: "secret".into(),
            force_path_style: true,
        };
        assert!(factory.create(&info).await.is_ok());
    }
}
