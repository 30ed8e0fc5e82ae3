//! File share store
//!
//! Files are copied under the share root using the process identity.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use super::{remote_segments, ArtifactStore, StoreError};
use crate::retry::{classify_store_error, RetryConfig, RetryExecutor};

/// Artifact store backed by a local or mounted file share
#[derive(Debug, Clone)]
pub struct LocalFileShareStore {
    root: PathBuf,
    retry: RetryExecutor,
    timeout: Duration,
}

impl LocalFileShareStore {
    /// Store rooted at `root`
    pub fn new(root: PathBuf, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            root,
            retry: RetryExecutor::new(retry),
            timeout,
        }
    }

    /// Root folder of the share
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, remote_path: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.root.clone();
        for segment in remote_segments(remote_path)? {
            path.push(segment);
        }
        Ok(path)
    }

    async fn copy_with_retry(
        &self,
        operation_name: &str,
        source: PathBuf,
        destination: PathBuf,
        is_file: bool,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        let attempt = self.retry.execute(
            operation_name,
            (source, destination),
            cancellation,
            classify_store_error,
            |(source, destination), _| async move {
                tokio::task::spawn_blocking(move || copy_entry(&source, &destination, is_file))
                    .await
                    .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
            },
        );

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

fn copy_entry(source: &Path, destination: &Path, is_file: bool) -> Result<(), StoreError> {
    if is_file {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::from_io(e, parent))?;
        }
        std::fs::copy(source, destination).map_err(|e| StoreError::from_io(e, source))?;
        return Ok(());
    }

    if !source.is_dir() {
        return Err(StoreError::NotFound(source.display().to_string()));
    }

    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| StoreError::from_io(e.into(), source))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| StoreError::InvalidPath(entry.path().display().to_string()))?;
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| StoreError::from_io(e, &target))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::from_io(e, parent))?;
            }
            std::fs::copy(entry.path(), &target).map_err(|e| StoreError::from_io(e, entry.path()))?;
        }
    }
    Ok(())
}

#[async_trait]
impl ArtifactStore for LocalFileShareStore {
    #[instrument(skip(self, cancellation), fields(root = %self.root.display()))]
    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        is_file: bool,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        let destination = self.resolve(remote_path)?;
        debug!(destination = %destination.display(), "Uploading to file share");
        self.copy_with_retry(
            "file_share.upload",
            local_path.to_path_buf(),
            destination,
            is_file,
            cancellation,
        )
        .await
    }

    #[instrument(skip(self, cancellation), fields(root = %self.root.display()))]
    async fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        is_file: bool,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        let source = self.resolve(remote_path)?;
        debug!(source = %source.display(), "Downloading from file share");
        self.copy_with_retry(
            "file_share.download",
            source,
            local_path.to_path_buf(),
            is_file,
            cancellation,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(root: &Path) -> LocalFileShareStore {
        LocalFileShareStore::new(
            root.to_path_buf(),
            RetryConfig {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(2),
                max_retry_count: 2,
            },
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn folder_round_trips_through_share() {
        let share = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let backup = work.path().join("backup");
        std::fs::create_dir_all(backup.join("nested")).unwrap();
        std::fs::write(backup.join("data.bin"), b"payload").unwrap();
        std::fs::write(backup.join("nested/log.bin"), b"log").unwrap();

        let store = store(share.path());
        let token = CancellationToken::new();
        store.upload(&backup, "app/svc/p1/2024-01-01 00.00.00", false, &token).await.unwrap();
        assert!(share.path().join("app/svc/p1/2024-01-01 00.00.00/nested/log.bin").exists());

        let restored = work.path().join("restored");
        store.download("app/svc/p1/2024-01-01 00.00.00", &restored, false, &token).await.unwrap();
        assert_eq!(std::fs::read(restored.join("data.bin")).unwrap(), b"payload");
        assert_eq!(std::fs::read(restored.join("nested/log.bin")).unwrap(), b"log");
    }

    #[tokio::test]
    async fn single_file_creates_intermediate_folders() {
        let share = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let file = work.path().join("x.bkmetadata");
        std::fs::write(&file, b"meta").unwrap();

        let store = store(share.path());
        store
            .upload(&file, "a/b/c/x.bkmetadata", true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(share.path().join("a/b/c/x.bkmetadata")).unwrap(), b"meta");
    }

    #[tokio::test]
    async fn missing_remote_is_not_retried() {
        let share = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let result = store(share.path())
            .download("nope.tgz", &work.path().join("nope.tgz"), true, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let share = tempfile::tempdir().unwrap();
        let result = store(share.path())
            .upload(Path::new("/etc/hosts"), "../escape", true, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StoreError::InvalidPath(_))));
    }
}
