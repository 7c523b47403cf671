use super::{StorageBackend, StorageError, WriteOutcome};
use crate::types::{SyncDate, SyncRecord};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

const NAME: &str = "Redis";
const HASH_KEY: &str = "tggl_config";

// Writes only when the stored syncDate is missing or strictly older. Returns 1 when
// the hash was written, 0 when the write was stale.
const COMPARE_AND_SET: &str = r#"
local stored = redis.call('HGET', KEYS[1], 'syncDate')
if stored and tonumber(stored) >= tonumber(ARGV[2]) then
    return 0
end
redis.call('HSET', KEYS[1], 'config', ARGV[1], 'syncDate', ARGV[2])
return 1
"#;

/// Key-value storage holding the record in a hash with `config` and `syncDate`
/// fields. The first connection is bounded by `connect_timeout`; after that the
/// connection manager reconnects on its own.
pub struct RedisStorage {
    client: Client,
    connect_timeout: Duration,
    connection: Mutex<Option<ConnectionManager>>,
    script: Script,
}

impl RedisStorage {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self, StorageError> {
        let client = Client::open(url).map_err(|e| StorageError::connect(NAME, e))?;
        Ok(RedisStorage {
            client,
            connect_timeout,
            connection: Mutex::new(None),
            script: Script::new(COMPARE_AND_SET),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StorageError> {
        let mut connection = self.connection.lock().await;
        if let Some(connection) = connection.as_ref() {
            return Ok(connection.clone());
        }

        let manager = tokio::time::timeout(
            self.connect_timeout,
            ConnectionManager::new(self.client.clone()),
        )
        .await
        .map_err(|_| StorageError::NotResponding {
            backend: NAME.into(),
            timeout: self.connect_timeout,
        })?
        .map_err(|e| StorageError::connect(NAME, e))?;

        tracing::info!("Connected to Redis storage");
        *connection = Some(manager.clone());
        Ok(manager)
    }
}

/// Converts the stored hash into a record. An empty hash means nothing was written.
fn record_from_fields(mut fields: HashMap<String, String>) -> Result<SyncRecord, StorageError> {
    if fields.is_empty() {
        return Err(StorageError::not_found(NAME));
    }

    let (Some(config), Some(sync_date)) = (fields.remove("config"), fields.remove("syncDate"))
    else {
        return Err(StorageError::malformed(
            NAME,
            "hash is missing the config or syncDate field",
        ));
    };

    let sync_date: u64 = sync_date
        .parse()
        .map_err(|e| StorageError::malformed(NAME, e))?;

    Ok(SyncRecord::new(config, SyncDate::from_millis(sync_date)))
}

#[async_trait]
impl StorageBackend for RedisStorage {
    fn name(&self) -> &str {
        NAME
    }

    async fn get_config(&self) -> Result<SyncRecord, StorageError> {
        let mut connection = self.connection().await?;

        let fields: HashMap<String, String> = connection
            .hgetall(HASH_KEY)
            .await
            .map_err(|e| StorageError::fetch(NAME, e))?;

        record_from_fields(fields)
    }

    async fn set_config(&self, record: &SyncRecord) -> Result<WriteOutcome, StorageError> {
        let mut connection = self.connection().await?;

        let written: i64 = self
            .script
            .key(HASH_KEY)
            .arg(&record.config)
            .arg(record.sync_date.as_millis())
            .invoke_async(&mut connection)
            .await
            .map_err(|e| StorageError::write(NAME, e))?;

        Ok(if written == 1 {
            WriteOutcome::Written
        } else {
            WriteOutcome::Skipped
        })
    }

    async fn close(&self) {
        // Dropping the last handle stops the reconnect task and closes the socket.
        if self.connection.lock().await.take().is_none() {
            tracing::debug!("Redis storage was never connected");
        }
    }
}
