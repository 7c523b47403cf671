use super::{StorageBackend, StorageError, WriteOutcome};
use crate::types::{SyncDate, SyncRecord};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tokio::sync::OnceCell;

const NAME: &str = "Postgres";
const CONFIG_KEY: &str = "flags";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tggl_config (
    key TEXT PRIMARY KEY,
    config TEXT NOT NULL,
    sync_date BIGINT NOT NULL
)
"#;

/// Relational storage. The schema is created lazily on the first connection; the
/// compare-and-write runs in a single transaction holding a row lock.
pub struct PostgresStorage {
    url: Option<String>,
    pool: OnceCell<PgPool>,
}

impl PostgresStorage {
    pub fn new(url: Option<String>) -> Self {
        PostgresStorage {
            url: url.filter(|u| !u.is_empty()),
            pool: OnceCell::new(),
        }
    }

    /// A storage built without a connection string is a no-op.
    pub fn enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn pool(&self) -> Result<&PgPool, StorageError> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| StorageError::connect(NAME, "no connection string provided"))?;

        self.pool
            .get_or_try_init(|| async {
                let pool = PgPoolOptions::new()
                    .max_connections(2)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect(url)
                    .await
                    .map_err(|e| StorageError::connect(NAME, e))?;

                sqlx::query(CREATE_TABLE)
                    .execute(&pool)
                    .await
                    .map_err(|e| StorageError::SchemaInitFailed {
                        backend: NAME.into(),
                        source: e.into(),
                    })?;

                tracing::info!("Connected to Postgres storage");
                Ok::<_, StorageError>(pool)
            })
            .await
    }
}

#[async_trait]
impl StorageBackend for PostgresStorage {
    fn name(&self) -> &str {
        NAME
    }

    async fn get_config(&self) -> Result<SyncRecord, StorageError> {
        let pool = self.pool().await?;

        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT config, sync_date FROM tggl_config WHERE key = $1")
                .bind(CONFIG_KEY)
                .fetch_optional(pool)
                .await
                .map_err(|e| StorageError::fetch(NAME, e))?;

        let (config, sync_date) = row.ok_or_else(|| StorageError::not_found(NAME))?;
        let sync_date = u64::try_from(sync_date).map_err(|e| StorageError::malformed(NAME, e))?;

        Ok(SyncRecord::new(config, SyncDate::from_millis(sync_date)))
    }

    async fn set_config(&self, record: &SyncRecord) -> Result<WriteOutcome, StorageError> {
        let pool = self.pool().await?;
        let incoming =
            i64::try_from(record.sync_date.as_millis()).map_err(|e| StorageError::write(NAME, e))?;

        let mut tx = pool.begin().await.map_err(|e| StorageError::write(NAME, e))?;

        let stored: Option<(i64,)> =
            sqlx::query_as("SELECT sync_date FROM tggl_config WHERE key = $1 FOR UPDATE")
                .bind(CONFIG_KEY)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StorageError::write(NAME, e))?;

        if let Some((stored,)) = stored
            && stored >= incoming
        {
            tx.rollback().await.map_err(|e| StorageError::write(NAME, e))?;
            return Ok(WriteOutcome::Skipped);
        }

        // The WHERE clause covers two replicas racing to insert the first row, where
        // there was no row to lock.
        let result = sqlx::query(
            "INSERT INTO tggl_config (key, config, sync_date) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET config = EXCLUDED.config, sync_date = EXCLUDED.sync_date \
             WHERE tggl_config.sync_date < EXCLUDED.sync_date",
        )
        .bind(CONFIG_KEY)
        .bind(&record.config)
        .bind(incoming)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::write(NAME, e))?;

        tx.commit().await.map_err(|e| StorageError::write(NAME, e))?;

        Ok(if result.rows_affected() == 0 {
            WriteOutcome::Skipped
        } else {
            WriteOutcome::Written
        })
    }

    async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }
}
