use serde::Deserialize;
use std::time::Duration;
use url::Url;

pub const DEFAULT_AUTHORITY_URL: &str = "https://api.tggl.io";

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Zstd1,
    Zstd3,
}

/// One storage backend. The order of the configured list is the fallback priority.
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StorageConfig {
    Postgres {
        /// A missing URL leaves the backend disabled.
        url: Option<String>,
    },
    Redis {
        url: String,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
    },
    S3 {
        bucket: String,
        region: Option<String>,
        #[serde(default = "default_object_key")]
        key: String,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        endpoint_url: Option<String>,
    },
    Filesystem {
        base_dir: String,
        filename: String,
        #[serde(default)]
        compression: Compression,
    },
}

impl StorageConfig {
    /// Name of the backend built from this entry, used in logs and for write-back exclusion.
    pub fn name(&self) -> &'static str {
        match self {
            StorageConfig::Postgres { .. } => "Postgres",
            StorageConfig::Redis { .. } => "Redis",
            StorageConfig::S3 { .. } => "S3",
            StorageConfig::Filesystem { .. } => "Filesystem",
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_object_key() -> String {
    "tggl_config".into()
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct AuthorityConfig {
    #[serde(default = "default_authority_url")]
    pub url: Url,
    pub api_key: String,
}

fn default_authority_url() -> Url {
    Url::parse(DEFAULT_AUTHORITY_URL).expect("default authority url is valid")
}

/// Timing knobs of the synchronizer. All values are milliseconds.
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    pub polling_interval_ms: u64,
    /// Zero or negative disables the staleness check.
    pub max_config_age_ms: i64,
    pub max_startup_time_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            polling_interval_ms: 5_000,
            max_config_age_ms: 30_000,
            max_startup_time_ms: 10_000,
        }
    }
}

impl SyncSettings {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn max_startup_time(&self) -> Duration {
        Duration::from_millis(self.max_startup_time_ms)
    }
}
