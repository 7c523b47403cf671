//! Storage backends keep a durable copy of the latest configuration so it can be
//! served across restarts and while the authority is unreachable.
use crate::config::StorageConfig;
use crate::types::SyncRecord;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

mod file;
mod postgres;
mod redis;
mod s3;

pub use file::FilesystemStorage;
pub use postgres::PostgresStorage;
pub use redis::RedisStorage;
pub use s3::S3Storage;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Every variant names the backend it came from.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("failed to connect to {backend}: {source}")]
    ConnectFailed { backend: String, source: BoxError },

    #[error("failed to create schema in {backend}: {source}")]
    SchemaInitFailed { backend: String, source: BoxError },

    #[error("successfully connected to {backend}, but no config found")]
    NotFound { backend: String },

    #[error("{backend} not responding after {timeout:?}")]
    NotResponding { backend: String, timeout: Duration },

    #[error("malformed config payload in {backend}: {source}")]
    MalformedPayload { backend: String, source: BoxError },

    #[error("failed to fetch config from {backend}: {source}")]
    FetchFailed { backend: String, source: BoxError },

    #[error("failed to write config to {backend}: {source}")]
    WriteFailed { backend: String, source: BoxError },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub(crate) fn connect(backend: &str, source: impl Into<BoxError>) -> Self {
        StorageError::ConnectFailed {
            backend: backend.into(),
            source: source.into(),
        }
    }

    pub(crate) fn malformed(backend: &str, source: impl Into<BoxError>) -> Self {
        StorageError::MalformedPayload {
            backend: backend.into(),
            source: source.into(),
        }
    }

    pub(crate) fn fetch(backend: &str, source: impl Into<BoxError>) -> Self {
        StorageError::FetchFailed {
            backend: backend.into(),
            source: source.into(),
        }
    }

    pub(crate) fn write(backend: &str, source: impl Into<BoxError>) -> Self {
        StorageError::WriteFailed {
            backend: backend.into(),
            source: source.into(),
        }
    }

    pub(crate) fn not_found(backend: &str) -> Self {
        StorageError::NotFound {
            backend: backend.into(),
        }
    }
}

/// Result of a write. A stale write is not an error, it is skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Skipped,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the stored record, or `NotFound` if nothing was ever written.
    async fn get_config(&self) -> Result<SyncRecord, StorageError>;

    /// Stores `record` unless the stored sync date is greater than or equal to
    /// `record.sync_date`.
    async fn set_config(&self, record: &SyncRecord) -> Result<WriteOutcome, StorageError>;

    /// Releases connections. Failures are logged by the implementation.
    async fn close(&self) {}
}

/// Builds the configured backends, in priority order. Disabled backends are left out.
pub fn build_backends(configs: &[StorageConfig]) -> Vec<Arc<dyn StorageBackend>> {
    let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::with_capacity(configs.len());

    for config in configs {
        match config {
            StorageConfig::Postgres { url } => {
                let storage = PostgresStorage::new(url.clone());
                if storage.enabled() {
                    backends.push(Arc::new(storage));
                } else {
                    tracing::warn!("Postgres storage configured without a url, skipping it");
                }
            }
            StorageConfig::Redis {
                url,
                connect_timeout_ms,
            } => match RedisStorage::new(url, Duration::from_millis(*connect_timeout_ms)) {
                Ok(storage) => backends.push(Arc::new(storage)),
                Err(e) => tracing::error!(error = %e, "Invalid Redis storage configuration, skipping it"),
            },
            StorageConfig::S3 {
                bucket,
                region,
                key,
                access_key_id,
                secret_access_key,
                endpoint_url,
            } => {
                let credentials = match (access_key_id, secret_access_key) {
                    (Some(id), Some(secret)) => Some((id.clone(), secret.clone())),
                    (None, None) => None,
                    _ => {
                        tracing::error!(
                            "access_key_id and secret_access_key must both be set for S3 storage, skipping it"
                        );
                        continue;
                    }
                };
                backends.push(Arc::new(S3Storage::new(s3::S3Options {
                    bucket: bucket.clone(),
                    key: key.clone(),
                    region: region.clone(),
                    credentials,
                    endpoint_url: endpoint_url.clone(),
                })));
            }
            StorageConfig::Filesystem {
                base_dir,
                filename,
                compression,
            } => backends.push(Arc::new(FilesystemStorage::new(
                base_dir,
                filename,
                *compression,
            ))),
        }
    }

    backends
}
