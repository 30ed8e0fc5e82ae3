//! S3 object client

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;

use super::{BackupStoreInformation, ObjectClient, StoreError};

/// [`ObjectClient`] over the AWS SDK
#[derive(Debug, Clone)]
pub struct S3ObjectClient {
    client: Client,
}

impl S3ObjectClient {
    /// Build a client for a cloud store variant.
    ///
    /// `CloudBlob` uses the explicit key pair, `DelegatedCloudBlob` the
    /// default credential provider chain.
    pub async fn from_store_information(info: &BackupStoreInformation) -> Result<Self, StoreError> {
        let (region, endpoint_url, static_credentials, force_path_style) = match info {
            BackupStoreInformation::CloudBlob {
                region,
                endpoint_url,
                access_key_id,
                secret_access_key,
                force_path_style,
                ..
            } => (
                region,
                endpoint_url,
                Some(Credentials::new(
                    access_key_id.clone(),
                    secret_access_key.clone(),
                    None,
                    None,
                    "replica-backup",
                )),
                *force_path_style,
            ),
            BackupStoreInformation::DelegatedCloudBlob { region, endpoint_url, .. } => {
                (region, endpoint_url, None, false)
            }
            BackupStoreInformation::FileShare { .. } => {
                return Err(StoreError::Unsupported("file share is not an object store".into()))
            }
        };

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()));
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(credentials) = static_credentials {
            builder = builder.credentials_provider(credentials);
        }
        if force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
        })
    }
}

fn map_sdk_error<E>(err: SdkError<E, HttpResponse>, key: &str) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let message = format!("{}: {}", key, aws_sdk_s3::error::DisplayErrorContext(&err));
    match status {
        Some(404) => StoreError::NotFound(key.to_string()),
        Some(401) | Some(403) => StoreError::Unauthorized(message),
        Some(status) if status >= 500 || status == 429 => StoreError::Transient(message),
        Some(status) => StoreError::Rejected { status, message },
        // Dispatch failures and timeouts never produced a response
        None => StoreError::Transient(message),
    }
}

#[async_trait]
impl ObjectClient for S3ObjectClient {
    async fn put_object(&self, container: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(container)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        Ok(())
    }

    async fn get_object(&self, container: &str, key: &str) -> Result<Bytes, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(container)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Transient(format!("Failed to read body of {}: {}", key, e)))?;
        Ok(body.into_bytes())
    }

    async fn list_objects(&self, container: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(container)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, prefix))?;

            keys.extend(response.contents().iter().filter_map(|o| o.key().map(str::to_string)));

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }
}
