use crate::authority::Authority;
use crate::config::SyncSettings;
use crate::engine::Engine;
use crate::health::{self, Health};
use crate::metrics_defs::{
    CONFIG_AGE, CONFIG_SYNC_DURATION, CONFIG_SYNC_FAILURE, CONFIG_SYNC_SUCCESS,
    STORAGE_WRITE_FAILURE,
};
use crate::readiness::ReadinessGate;
use crate::storage::{StorageBackend, WriteOutcome};
use crate::types::{FlagConfig, SyncDate, SyncRecord};
use parking_lot::{Mutex, RwLock};
use shared::{counter, gauge, histogram};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

const BOOTSTRAP_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("neither the authority nor any storage provided a config")]
    NoSource,
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("the sync worker is not running")]
    WorkerGone,
}

/// Where the installed configuration of a successful cycle came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    Authority,
    Storage(String),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Authority => write!(f, "authority"),
            ConfigSource::Storage(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug)]
enum Command {
    // Fetch outside of the polling interval. The worker replies once the cycle finishes.
    Refresh(oneshot::Sender<Result<ConfigSource, SyncError>>),
    Shutdown,
}

struct ConfigSyncInner {
    synchronizer: Arc<Synchronizer>,
    tx: mpsc::Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the background config synchronization. Cloning is cheap, every clone
/// talks to the same worker.
#[derive(Clone)]
pub struct ConfigSync {
    inner: Arc<ConfigSyncInner>,
}

impl ConfigSync {
    /// Spawns the worker. It bootstraps, opens the readiness gate and then polls until
    /// [`ConfigSync::shutdown`] is called. Must be called from within a tokio runtime.
    pub fn new(
        authority: Arc<dyn Authority>,
        backends: Vec<Arc<dyn StorageBackend>>,
        engine: Arc<Engine>,
        settings: SyncSettings,
    ) -> Self {
        if backends.is_empty() {
            tracing::info!("No storage configured, relying on the authority only");
        } else {
            let names: Vec<&str> = backends.iter().map(|b| b.name()).collect();
            tracing::info!(storages = ?names, "Using storages");
        }

        let (tx, rx) = mpsc::channel::<Command>(64);

        let synchronizer = Arc::new(Synchronizer::new(authority, backends, engine, settings));

        // All fetching happens on this task.
        let worker = synchronizer.clone();
        let handle = tokio::spawn(async move {
            worker.run(rx).await;
        });

        ConfigSync {
            inner: Arc::new(ConfigSyncInner {
                synchronizer,
                tx,
                handle: Mutex::new(Some(handle)),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.inner.synchronizer.engine
    }

    pub fn is_ready(&self) -> bool {
        self.inner.synchronizer.readiness.is_ready()
    }

    /// Resolves once bootstrap finished, successfully or not.
    pub async fn wait_ready(&self) {
        self.inner.synchronizer.readiness.wait().await
    }

    pub fn last_successful_sync(&self) -> Option<SyncDate> {
        *self.inner.synchronizer.last_sync.read()
    }

    /// Evaluates health at `now` and reports the config age gauge.
    pub fn health(&self, now: SyncDate) -> Health {
        let last_sync = self.last_successful_sync();
        gauge!(CONFIG_AGE).set(health::config_age_ms(last_sync, now));
        health::evaluate(
            last_sync,
            self.inner.synchronizer.settings.max_config_age_ms,
            now,
        )
    }

    /// Runs a fetch cycle on the worker outside of the polling interval.
    pub async fn refresh(&self) -> Result<ConfigSource, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Command::Refresh(tx))
            .await
            .map_err(|_| SyncError::WorkerGone)?;
        rx.await.map_err(|_| SyncError::WorkerGone)?
    }

    /// Stops polling and closes every storage backend.
    pub async fn shutdown(&self) {
        if self.inner.tx.send(Command::Shutdown).await.is_err() {
            tracing::debug!("Sync worker already stopped");
        }

        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Sync worker terminated abnormally");
        }

        for backend in &self.inner.synchronizer.backends {
            backend.close().await;
            tracing::info!("{} storage closed", backend.name());
        }
    }
}

/// Keeps the engine's configuration in sync with the authority and the storage
/// backends. Used internally by [`ConfigSync`].
struct Synchronizer {
    authority: Arc<dyn Authority>,
    // In fallback priority order.
    backends: Vec<Arc<dyn StorageBackend>>,
    engine: Arc<Engine>,
    settings: SyncSettings,
    last_sync: RwLock<Option<SyncDate>>,
    // Held for a whole fetch cycle so cycles never overlap.
    update_lock: tokio::sync::Mutex<()>,
    readiness: ReadinessGate,
}

impl Synchronizer {
    fn new(
        authority: Arc<dyn Authority>,
        backends: Vec<Arc<dyn StorageBackend>>,
        engine: Arc<Engine>,
        settings: SyncSettings,
    ) -> Self {
        Synchronizer {
            authority,
            backends,
            engine,
            settings,
            last_sync: RwLock::new(None),
            update_lock: tokio::sync::Mutex::new(()),
            readiness: ReadinessGate::new(),
        }
    }

    /// Bootstraps, then polls at the configured interval until the Shutdown command is
    /// received. A Refresh command triggers a cycle before the next interval.
    async fn run(&self, mut rx: mpsc::Receiver<Command>) {
        self.bootstrap().await;

        let interval = self.settings.polling_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.fetch_config().await {
                        tracing::warn!(error = %e, "Config sync failed");
                    }
                }
                cmd = rx.recv() => match cmd {
                    Some(Command::Refresh(reply)) => {
                        let result = self.fetch_config().await;
                        if reply.send(result).is_err() {
                            tracing::debug!("Refresh requester went away");
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        tracing::info!("Stopping config sync");
                        break;
                    }
                },
            }
        }
    }

    /// Retries every 500ms until a cycle succeeds or the startup budget runs out. A cycle
    /// still in flight at the deadline is abandoned. The readiness gate opens either way.
    async fn bootstrap(&self) {
        let deadline = Instant::now() + self.settings.max_startup_time();

        loop {
            match tokio::time::timeout_at(deadline, self.fetch_config()).await {
                Ok(Ok(source)) => {
                    tracing::info!(%source, "Initial config loaded");
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Initial config sync failed");
                }
                Err(_) => {
                    tracing::warn!("Initial config sync did not finish before the startup deadline");
                }
            }

            tokio::time::sleep_until(deadline.min(Instant::now() + BOOTSTRAP_RETRY_DELAY)).await;
            if Instant::now() >= deadline {
                tracing::error!(
                    "Could not load a config within {:?}, starting with an empty config",
                    self.settings.max_startup_time()
                );
                break;
            }
        }

        self.readiness.set_ready();
    }

    /// Runs one fetch cycle: the authority first, then the storages in priority order.
    async fn fetch_config(&self) -> Result<ConfigSource, SyncError> {
        let _guard = self.update_lock.lock().await;
        let started = Instant::now();

        let result = self.fetch_config_inner().await;

        histogram!(CONFIG_SYNC_DURATION).record(started.elapsed().as_secs_f64());
        gauge!(CONFIG_AGE).set(health::config_age_ms(*self.last_sync.read(), SyncDate::now()));
        match &result {
            Ok(source) => counter!(CONFIG_SYNC_SUCCESS, "source" => source.to_string()).increment(1),
            Err(_) => counter!(CONFIG_SYNC_FAILURE).increment(1),
        }

        result
    }

    async fn fetch_config_inner(&self) -> Result<ConfigSource, SyncError> {
        match self.authority.fetch_config().await {
            Ok(config) => {
                let record = SyncRecord::new(config.to_json()?, SyncDate::now());
                tracing::debug!(sync_date = %record.sync_date, "Fetched config from the authority");
                self.install(config, record.sync_date);
                self.write_back(&record, None).await;
                return Ok(ConfigSource::Authority);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch config from the authority, trying storages");
            }
        }

        // Only a record strictly newer than everything seen so far becomes the candidate.
        let mut newest = *self.last_sync.read();
        let mut candidate: Option<(usize, SyncRecord, FlagConfig)> = None;

        for (index, backend) in self.backends.iter().enumerate() {
            let record = match backend.get_config().await {
                Ok(record) => record,
                Err(e) if e.is_not_found() => {
                    tracing::info!(backend = backend.name(), "{e}");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(backend = backend.name(), error = %e, "Failed to read config from storage");
                    continue;
                }
            };

            if let Some(newest) = newest
                && record.sync_date <= newest
            {
                tracing::debug!(
                    backend = backend.name(),
                    sync_date = %record.sync_date,
                    newest = %newest,
                    "Stored config is not newer, skipping it"
                );
                continue;
            }

            match FlagConfig::parse(&record.config) {
                Ok(config) => {
                    newest = Some(record.sync_date);
                    candidate = Some((index, record, config));
                }
                Err(e) => {
                    tracing::warn!(backend = backend.name(), error = %e, "Stored config is malformed, skipping it");
                }
            }
        }

        match candidate {
            Some((index, record, config)) => {
                let source = self.backends[index].name().to_string();
                tracing::info!(backend = %source, sync_date = %record.sync_date, "Loaded config from storage");
                self.install(config, record.sync_date);
                self.write_back(&record, Some(index)).await;
                Ok(ConfigSource::Storage(source))
            }
            None => {
                let kept = *self.last_sync.read();
                if kept.is_some() {
                    tracing::warn!("No newer config available, keeping the current one");
                }
                Err(SyncError::NoSource)
            }
        }
    }

    /// Swaps the engine's configuration and logs what changed.
    fn install(&self, config: FlagConfig, sync_date: SyncDate) {
        let previous = self.engine.config();
        let had_previous = self.last_sync.read().is_some();

        if had_previous {
            log_changes(&previous, &config);
        }

        tracing::debug!(flags = config.len(), %sync_date, "Installing config");
        self.engine.set_config(config);
        *self.last_sync.write() = Some(sync_date);
    }

    /// Writes `record` to every backend except `exclude`, concurrently. Failures are
    /// logged per backend.
    async fn write_back(&self, record: &SyncRecord, exclude: Option<usize>) {
        let mut writes = JoinSet::new();

        for (index, backend) in self.backends.iter().enumerate() {
            if Some(index) == exclude {
                continue;
            }
            let backend = backend.clone();
            let record = record.clone();
            writes.spawn(async move {
                match backend.set_config(&record).await {
                    Ok(WriteOutcome::Written) => {
                        tracing::debug!(backend = backend.name(), sync_date = %record.sync_date, "Config written to storage");
                    }
                    Ok(WriteOutcome::Skipped) => {
                        tracing::debug!(backend = backend.name(), "Storage already holds a newer config");
                    }
                    Err(e) => {
                        counter!(STORAGE_WRITE_FAILURE, "backend" => backend.name().to_string())
                            .increment(1);
                        tracing::error!(backend = backend.name(), error = %e, "Failed to write config to storage");
                    }
                }
            });
        }

        while let Some(result) = writes.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Storage write task failed");
            }
        }
    }
}

fn log_changes(previous: &FlagConfig, next: &FlagConfig) {
    let diff = previous.diff(next);
    if diff.is_empty() {
        tracing::info!("Config unchanged");
        return;
    }
    for slug in &diff.new_flags {
        tracing::info!(flag = %slug, "New flag");
    }
    for slug in &diff.deleted_flags {
        tracing::info!(flag = %slug, "Deleted flag");
    }
    for slug in &diff.updated_flags {
        tracing::info!(flag = %slug, "Updated flag");
    }
}
