use super::{StorageBackend, StorageError, WriteOutcome};
use crate::types::{SyncDate, SyncRecord};
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

const NAME: &str = "S3";

pub struct S3Options {
    pub bucket: String,
    pub key: String,
    pub region: Option<String>,
    /// Access key id and secret. Falls back to the default AWS provider chain when unset.
    pub credentials: Option<(String, String)>,
    pub endpoint_url: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredObject {
    config: String,
    sync_date: u64,
}

/// Object storage. There is no conditional put, so the write reads the current object,
/// compares and then writes. Two replicas writing at the same instant can race.
pub struct S3Storage {
    options: S3Options,
    client: Mutex<Option<S3Client>>,
}

impl S3Storage {
    pub fn new(options: S3Options) -> Self {
        S3Storage {
            options,
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> S3Client {
        let mut client = self.client.lock().await;
        if let Some(client) = client.as_ref() {
            return client.clone();
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &self.options.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some((id, secret)) = &self.options.credentials {
            loader = loader.credentials_provider(Credentials::new(
                id.clone(),
                secret.clone(),
                None,
                None,
                "flagproxy-config",
            ));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &self.options.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let s3 = S3Client::from_conf(builder.build());
        *client = Some(s3.clone());
        s3
    }
}

fn decode_object(bytes: &[u8]) -> Result<SyncRecord, StorageError> {
    let object: StoredObject =
        serde_json::from_slice(bytes).map_err(|e| StorageError::malformed(NAME, e))?;
    Ok(SyncRecord::new(
        object.config,
        SyncDate::from_millis(object.sync_date),
    ))
}

fn encode_object(record: &SyncRecord) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&StoredObject {
        config: record.config.clone(),
        sync_date: record.sync_date.as_millis(),
    })
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn name(&self) -> &str {
        NAME
    }

    async fn get_config(&self) -> Result<SyncRecord, StorageError> {
        let output = self
            .client()
            .await
            .get_object()
            .bucket(&self.options.bucket)
            .key(&self.options.key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::not_found(NAME)
                } else {
                    StorageError::fetch(NAME, DisplayErrorContext(&e).to_string())
                }
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::fetch(NAME, e))?
            .into_bytes();

        decode_object(&bytes)
    }

    async fn set_config(&self, record: &SyncRecord) -> Result<WriteOutcome, StorageError> {
        match self.get_config().await {
            Ok(existing) if existing.sync_date >= record.sync_date => {
                return Ok(WriteOutcome::Skipped);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "No readable config in S3, writing"),
        }

        let body = encode_object(record).map_err(|e| StorageError::write(NAME, e))?;

        self.client()
            .await
            .put_object()
            .bucket(&self.options.bucket)
            .key(&self.options.key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StorageError::write(NAME, DisplayErrorContext(&e).to_string()))?;

        Ok(WriteOutcome::Written)
    }

    async fn close(&self) {
        // Releases the client's connection pool once in-flight requests finish.
        self.client.lock().await.take();
    }
}
