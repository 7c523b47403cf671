use crate::authority::{Authority, AuthorityError};
use crate::storage::{StorageBackend, StorageError, WriteOutcome};
use crate::types::{FlagConfig, SyncDate, SyncRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Builds a configuration with one flag per slug.
pub fn flag_config(slugs: &[&str]) -> FlagConfig {
    FlagConfig::from_flags(
        slugs
            .iter()
            .map(|slug| json!({"slug": slug, "conditions": []}))
            .collect(),
    )
    .expect("test flags have slugs")
}

pub fn record(slugs: &[&str], sync_date: u64) -> SyncRecord {
    SyncRecord::new(
        flag_config(slugs).to_json().expect("serializable"),
        SyncDate::from_millis(sync_date),
    )
}

/// Authority whose next response can be swapped at any time.
pub struct TestAuthority {
    response: Mutex<Option<FlagConfig>>,
    calls: AtomicUsize,
    hanging: AtomicBool,
}

impl TestAuthority {
    pub fn failing() -> Self {
        TestAuthority {
            response: Mutex::new(None),
            calls: AtomicUsize::new(0),
            hanging: AtomicBool::new(false),
        }
    }

    /// Never answers, like an authority that accepted the connection and went silent.
    pub fn hanging() -> Self {
        let authority = TestAuthority::failing();
        authority.hanging.store(true, Ordering::SeqCst);
        authority
    }

    pub fn serving(config: FlagConfig) -> Self {
        let authority = TestAuthority::failing();
        authority.set_response(Some(config));
        authority
    }

    pub fn set_response(&self, response: Option<FlagConfig>) {
        *self.response.lock() = response;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authority for TestAuthority {
    async fn fetch_config(&self) -> Result<FlagConfig, AuthorityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.response
            .lock()
            .clone()
            .ok_or(AuthorityError::Status(StatusCode::SERVICE_UNAVAILABLE))
    }
}

/// In-memory backend with the same compare-and-write contract as the real ones.
pub struct MemoryStorage {
    name: String,
    record: Mutex<Option<SyncRecord>>,
    unavailable: Mutex<bool>,
    set_calls: Mutex<Vec<SyncRecord>>,
    closed: Mutex<bool>,
}

impl MemoryStorage {
    pub fn new(name: &str) -> Self {
        MemoryStorage {
            name: name.into(),
            record: Mutex::new(None),
            unavailable: Mutex::new(false),
            set_calls: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        }
    }

    pub fn with_record(name: &str, record: SyncRecord) -> Self {
        let storage = MemoryStorage::new(name);
        *storage.record.lock() = Some(record);
        storage
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    pub fn stored(&self) -> Option<SyncRecord> {
        self.record.lock().clone()
    }

    /// Every record passed to `set_config`, accepted or not.
    pub fn set_calls(&self) -> Vec<SyncRecord> {
        self.set_calls.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_config(&self) -> Result<SyncRecord, StorageError> {
        if *self.unavailable.lock() {
            return Err(StorageError::fetch(&self.name, "unavailable"));
        }
        self.record
            .lock()
            .clone()
            .ok_or_else(|| StorageError::not_found(&self.name))
    }

    async fn set_config(&self, record: &SyncRecord) -> Result<WriteOutcome, StorageError> {
        self.set_calls.lock().push(record.clone());
        if *self.unavailable.lock() {
            return Err(StorageError::write(&self.name, "unavailable"));
        }

        let mut stored = self.record.lock();
        if let Some(existing) = stored.as_ref()
            && existing.sync_date >= record.sync_date
        {
            return Ok(WriteOutcome::Skipped);
        }
        *stored = Some(record.clone());
        Ok(WriteOutcome::Written)
    }

    async fn close(&self) {
        *self.closed.lock() = true;
    }
}
