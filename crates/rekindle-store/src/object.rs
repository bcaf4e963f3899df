//! Object store abstraction and the S3-compatible implementation.
//!
//! Layout used by the snapshot manager:
//!
//! ```text
//! <bucket>/
//! ├── <sha256-hex>            # memory chunks, content-addressed, no prefix
//! └── <revision>/
//!     ├── info                # snapshot metadata file
//!     └── snap                # VMM device-state blob
//! ```

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};

/// Storage backend for snapshot chunks and per-revision objects.
///
/// Contract: `put` is idempotent and read-after-write consistent per key.
/// Concurrent puts of the same key with identical content are race-free.
/// `get` of an absent key fails with [`StoreError::NotFound`].
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Creates the configured bucket if it does not exist. Idempotent.
    async fn ensure_bucket(&self) -> Result<()>;

    /// Writes `data` under `key`.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Reads the object stored under `key`.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Uploads a local file under `key`.
    ///
    /// The default implementation buffers the file; backends that can stream
    /// should override it.
    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let data = tokio::fs::read(path).await?;
        self.put(key, Bytes::from(data)).await
    }

    /// Downloads the object under `key` into a local file, returning the
    /// number of bytes written.
    async fn get_to_file(&self, key: &str, path: &Path) -> Result<u64> {
        let data = self.get(key).await?;
        tokio::fs::write(path, &data).await?;
        Ok(data.len() as u64)
    }
}

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Custom endpoint URL (e.g. a local MinIO). `None` uses AWS proper.
    pub endpoint: Option<String>,
    /// Region name; most S3-compatible servers accept any value here.
    pub region: String,
    /// Bucket holding chunks and snapshot objects.
    pub bucket: String,
    /// Static access key. `None` falls back to the ambient credential chain.
    pub access_key: Option<String>,
    /// Static secret key.
    pub secret_key: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            bucket: "snapshots".to_string(),
            access_key: None,
            secret_key: None,
        }
    }
}

/// S3-backed object store.
#[derive(Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    /// Builds a store from connection settings.
    ///
    /// Custom endpoints get path-style addressing, which is what MinIO and
    /// other self-hosted servers expect.
    #[must_use]
    pub fn new(cfg: &S3Config) -> Self {
        use aws_config::BehaviorVersion;
        use aws_sdk_s3::config::{Credentials, Region, SharedCredentialsProvider};

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()));

        if let Some(endpoint) = &cfg.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        if let (Some(ak), Some(sk)) = (&cfg.access_key, &cfg.secret_key) {
            let creds = Credentials::new(ak, sk, None, None, "rekindle");
            builder = builder.credentials_provider(SharedCredentialsProvider::new(creds));
        }

        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: cfg.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn ensure_bucket(&self) -> Result<()> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }

        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!(bucket = %self.bucket, "created bucket");
                Ok(())
            }
            Err(e) => {
                let service = e.into_service_error();
                if service.is_bucket_already_owned_by_you() || service.is_bucket_already_exists() {
                    Ok(())
                } else {
                    Err(StoreError::client(format!(
                        "creating bucket {}: {service}",
                        self.bucket
                    )))
                }
            }
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let len = data.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StoreError::client(format!("putting {key}: {}", e.into_service_error())))?;
        debug!(key, len, "put object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_get_error(key, e))?;

        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| StoreError::client(format!("reading body of {key}: {e}")))?;
        Ok(body.into_bytes())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = aws_sdk_s3::primitives::ByteStream::from_path(path)
            .await
            .map_err(|e| StoreError::client(format!("opening {}: {e}", path.display())))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::client(format!("putting {key}: {}", e.into_service_error())))?;
        Ok(())
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> Result<u64> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_get_error(key, e))?;

        let mut reader = resp.body.into_async_read();
        let mut file = tokio::fs::File::create(path).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.sync_all().await?;
        Ok(written)
    }
}

fn classify_get_error(
    key: &str,
    err: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::get_object::GetObjectError>,
) -> StoreError {
    let service = err.into_service_error();
    if service.is_no_such_key() {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::client(format!("getting {key}: {service}"))
    }
}
