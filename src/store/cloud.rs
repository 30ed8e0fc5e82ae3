//! Object storage backed artifact store

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use super::{remote_segments, ArtifactStore, StoreError};
use crate::retry::{classify_store_error, RetryConfig, RetryExecutor};

/// Minimal object storage operations the cloud store needs
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Store `body` under `key`, replacing any existing object
    async fn put_object(&self, container: &str, key: &str, body: Bytes) -> Result<(), StoreError>;

    /// Fetch the object stored under `key`
    async fn get_object(&self, container: &str, key: &str) -> Result<Bytes, StoreError>;

    /// Keys of every object whose key starts with `prefix`
    async fn list_objects(&self, container: &str, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Artifact store over an [`ObjectClient`]
#[derive(Clone)]
pub struct CloudBlobStore {
    client: Arc<dyn ObjectClient>,
    container: String,
    retry: RetryExecutor,
    timeout: Duration,
}

impl CloudBlobStore {
    /// Store writing to `container`
    pub fn new(
        client: Arc<dyn ObjectClient>,
        container: String,
        retry: RetryConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            container,
            retry: RetryExecutor::new(retry),
            timeout,
        }
    }

    async fn put_with_retry(
        &self,
        key: String,
        body: Bytes,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.retry
            .execute(
                "blob.put",
                (key, body),
                cancellation,
                classify_store_error,
                |(key, body), _| async move {
                    self.client.put_object(&self.container, &key, body).await
                },
            )
            .await
    }

    async fn get_with_retry(
        &self,
        key: String,
        cancellation: &CancellationToken,
    ) -> Result<Bytes, StoreError> {
        self.retry
            .execute("blob.get", key, cancellation, classify_store_error, |key, _| async move {
                self.client.get_object(&self.container, &key).await
            })
            .await
    }

    async fn upload_inner(
        &self,
        local_path: &Path,
        prefix: String,
        is_file: bool,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        if is_file {
            let body = tokio::fs::read(local_path)
                .await
                .map_err(|e| StoreError::from_io(e, local_path))?;
            return self.put_with_retry(prefix, Bytes::from(body), cancellation).await;
        }

        for (file, relative) in list_local_files(local_path)? {
            let body = tokio::fs::read(&file).await.map_err(|e| StoreError::from_io(e, &file))?;
            let key = format!("{}/{}", prefix, relative);
            debug!(key = %key, "Uploading object");
            self.put_with_retry(key, Bytes::from(body), cancellation).await?;
        }
        Ok(())
    }

    async fn download_inner(
        &self,
        prefix: String,
        local_path: &Path,
        is_file: bool,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        if is_file {
            let body = self.get_with_retry(prefix, cancellation).await?;
            return write_local(local_path, &body).await;
        }

        let folder_prefix = format!("{}/", prefix);
        let keys = self
            .retry
            .execute(
                "blob.list",
                folder_prefix.clone(),
                cancellation,
                classify_store_error,
                |p, _| async move { self.client.list_objects(&self.container, &p).await },
            )
            .await?;

        if keys.is_empty() {
            return Err(StoreError::NotFound(prefix));
        }

        for key in keys {
            let Some(relative) = key.strip_prefix(&folder_prefix) else {
                continue;
            };
            let mut target = local_path.to_path_buf();
            for segment in remote_segments(relative)? {
                target.push(segment);
            }
            let body = self.get_with_retry(key.clone(), cancellation).await?;
            write_local(&target, &body).await?;
        }
        Ok(())
    }
}

fn list_local_files(root: &Path) -> Result<Vec<(PathBuf, String)>, StoreError> {
    if !root.is_dir() {
        return Err(StoreError::NotFound(root.display().to_string()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| StoreError::from_io(e.into(), root))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| StoreError::InvalidPath(entry.path().display().to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), relative));
    }
    Ok(files)
}

async fn write_local(path: &Path, body: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::from_io(e, parent))?;
    }
    tokio::fs::write(path, body).await.map_err(|e| StoreError::from_io(e, path))
}

#[async_trait]
impl ArtifactStore for CloudBlobStore {
    #[instrument(skip(self, cancellation), fields(container = %self.container))]
    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        is_file: bool,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        let prefix = remote_segments(remote_path)?.join("/");
        let upload = self.upload_inner(local_path, prefix, is_file, cancellation);
        match tokio::time::timeout(self.timeout, upload).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    #[instrument(skip(self, cancellation), fields(container = %self.container))]
    async fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        is_file: bool,
        cancellation: &CancellationToken,
    ) -> Result<(), StoreError> {
        let prefix = remote_segments(remote_path)?.join("/");
        let download = self.download_inner(prefix, local_path, is_file, cancellation);
        match tokio::time::timeout(self.timeout, download).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectClient;

    fn store(client: Arc<MemoryObjectClient>) -> CloudBlobStore {
        CloudBlobStore::new(
            client,
            "backups".into(),
            RetryConfig {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(4),
                max_retry_count: 4,
            },
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn folder_upload_uses_forward_slash_keys() {
        let client = Arc::new(MemoryObjectClient::new());
        let work = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(work.path().join("b/sub")).unwrap();
        std::fs::write(work.path().join("b/sub/f.dat"), b"1").unwrap();

        store(client.clone())
            .upload(&work.path().join("b"), "app/svc/p", false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(client.keys("backups"), vec!["app/svc/p/sub/f.dat".to_string()]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let client = Arc::new(MemoryObjectClient::new());
        client.fail_next(2);
        let work = tempfile::tempdir().unwrap();
        let file = work.path().join("a.tgz");
        std::fs::write(&file, b"archive").unwrap();

        let store = store(client.clone());
        let token = CancellationToken::new();
        store.upload(&file, "p/a.tgz", true, &token).await.unwrap();

        let target = work.path().join("down/a.tgz");
        store.download("p/a.tgz", &target, true, &token).await.unwrap();
        assert_eq!(std::fs::read(target).unwrap(), b"archive");
    }

    #[tokio::test]
    async fn missing_folder_is_not_found() {
        let client = Arc::new(MemoryObjectClient::new());
        let work = tempfile::tempdir().unwrap();
        let result = store(client)
            .download("p/none", work.path(), false, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
