use config_sync::config::{AuthorityConfig, StorageConfig, SyncSettings};
use proxy::config::{AuthConfig, Listener};
use reporting::config::ReportingSettings;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "flagproxy".into()
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    /// Used when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            sentry_dsn: None,
            level: "info".into(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    pub authority: AuthorityConfig,
    /// In fallback priority order.
    #[serde(default)]
    pub storages: Vec<StorageConfig>,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub reporting: ReportingSettings,
    #[serde(default)]
    pub auth: AuthConfig,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data: Config = serde_yaml::from_reader(file)?;
        data.validate()?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.listener.port == 0 {
            return Err(ValidationError::InvalidPort);
        }

        if self.authority.api_key.trim().is_empty() {
            return Err(ValidationError::MissingApiKey);
        }

        if self.sync.polling_interval_ms == 0 {
            return Err(ValidationError::ZeroDuration("sync.polling_interval_ms"));
        }

        if self.reporting.flush_interval_ms == 0 {
            return Err(ValidationError::ZeroDuration("reporting.flush_interval_ms"));
        }

        if self.reporting.page_size == 0 {
            return Err(ValidationError::InvalidPageSize);
        }

        if let Some(dsn) = &self.logging.sentry_dsn
            && dsn.parse::<sentry::types::Dsn>().is_err()
        {
            return Err(ValidationError::InvalidSentryDsn);
        }

        let mut storage_names = HashSet::new();
        for storage in &self.storages {
            if !storage_names.insert(storage.name()) {
                return Err(ValidationError::DuplicateStorage(storage.name().into()));
            }
        }

        let mut paths = HashSet::new();
        for path in self.listener.paths.enabled() {
            if !path.starts_with('/') {
                return Err(ValidationError::InvalidPath(path.into()));
            }
            if !paths.insert(path) {
                return Err(ValidationError::DuplicatePath(path.into()));
            }
        }

        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    ValidationError(#[from] ValidationError),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("listener port must not be 0")]
    InvalidPort,
    #[error("authority api_key must be set")]
    MissingApiKey,
    #[error("{0} must be greater than 0")]
    ZeroDuration(&'static str),
    #[error("reporting page_size must be greater than 0")]
    InvalidPageSize,
    #[error("storage {0} is configured more than once")]
    DuplicateStorage(String),
    #[error("logging sentry_dsn is not a valid DSN")]
    InvalidSentryDsn,
    #[error("path {0} must start with /")]
    InvalidPath(String),
    #[error("path {0} is used by more than one endpoint")]
    DuplicatePath(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use config_sync::config::Compression;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).expect("parse config")
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
            listener:
                host: 0.0.0.0
                port: 8080
                paths:
                    config: null
            authority:
                url: https://flags.internal
                api_key: server-key
            storages:
                - type: redis
                  url: redis://cache:6379
                - type: filesystem
                  base_dir: /var/lib/flagproxy
                  filename: config.bin
                  compression: none
            sync:
                polling_interval_ms: 1000
                max_config_age_ms: 0
            reporting:
                enabled: false
            auth:
                client_api_keys: [key-a, key-b]
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                sentry_dsn: https://public@sentry.example.com/1
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert_eq!(config.listener.host, "0.0.0.0");
        assert_eq!(config.listener.port, 8080);
        assert_eq!(config.listener.paths.config, None);
        assert_eq!(config.authority.url.as_str(), "https://flags.internal/");
        assert_eq!(config.authority.api_key, "server-key");
        assert_eq!(config.storages.len(), 2);
        assert_eq!(
            config.storages[1],
            StorageConfig::Filesystem {
                base_dir: "/var/lib/flagproxy".into(),
                filename: "config.bin".into(),
                compression: Compression::None,
            }
        );
        assert_eq!(config.sync.polling_interval_ms, 1000);
        assert_eq!(config.sync.max_config_age_ms, 0);
        assert_eq!(config.sync.max_startup_time_ms, 10_000);
        assert!(!config.reporting.enabled);
        assert!(config.auth.reject_unauthorized);
        assert_eq!(config.auth.client_api_keys, vec!["key-a", "key-b"]);
        let metrics = config.metrics.expect("metrics config");
        assert_eq!(metrics.prefix, "flagproxy");
        assert_eq!(
            config.logging.sentry_dsn.as_deref(),
            Some("https://public@sentry.example.com/1")
        );
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_minimal_config() {
        let config = parse(
            r#"
            authority:
                api_key: server-key
            "#,
        );
        assert!(config.validate().is_ok());
        assert_eq!(config.listener.port, 3000);
        assert_eq!(config.authority.url.as_str(), "https://api.tggl.io/");
        assert!(config.storages.is_empty());
        assert!(config.reporting.enabled);
        assert!(config.metrics.is_none());
        assert!(config.logging.sentry_dsn.is_none());
    }

    #[test]
    fn test_validation() {
        let base = r#"
            authority:
                api_key: server-key
            "#;

        let mut config = parse(base);
        config.listener.port = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidPort));

        let mut config = parse(base);
        config.authority.api_key = " ".into();
        assert_eq!(config.validate(), Err(ValidationError::MissingApiKey));

        let mut config = parse(base);
        config.sync.polling_interval_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::ZeroDuration("sync.polling_interval_ms"))
        );

        let mut config = parse(base);
        config.reporting.page_size = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidPageSize));

        let mut config = parse(base);
        config.logging.sentry_dsn = Some("not a dsn".into());
        assert_eq!(config.validate(), Err(ValidationError::InvalidSentryDsn));

        let mut config = parse(base);
        config.listener.paths.report = Some("/flags".into());
        assert_eq!(
            config.validate(),
            Err(ValidationError::DuplicatePath("/flags".into()))
        );

        let mut config = parse(base);
        config.listener.paths.health = Some("health".into());
        assert_eq!(
            config.validate(),
            Err(ValidationError::InvalidPath("health".into()))
        );

        let config = parse(
            r#"
            authority:
                api_key: server-key
            storages:
                - type: redis
                  url: redis://a:6379
                - type: redis
                  url: redis://b:6379
            "#,
        );
        assert_eq!(
            config.validate(),
            Err(ValidationError::DuplicateStorage("Redis".into()))
        );
    }

    #[test]
    fn test_invalid_file() {
        let tmp = write_tmp_file("authority: [not, a, map]");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));

        let tmp = write_tmp_file("authority:\n    api_key: \"\"\n");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ValidationError(ValidationError::MissingApiKey))
        ));

        assert!(matches!(
            Config::from_file(std::path::Path::new("/nonexistent/flagproxy.yaml")),
            Err(ConfigError::LoadError(_))
        ));
    }
}
