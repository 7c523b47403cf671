use serde::Deserialize;
use std::time::Duration;
use url::Url;

pub const DEFAULT_REPORT_URL: &str = "https://api.tggl.io/report";

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ReportingSettings {
    pub enabled: bool,
    pub url: Url,
    pub flush_interval_ms: u64,
    /// Number of `(value[, label])` tuples per outbound call.
    pub page_size: usize,
    /// Values and labels are truncated to this many characters.
    pub max_value_length: usize,
}

impl Default for ReportingSettings {
    fn default() -> Self {
        ReportingSettings {
            enabled: true,
            url: Url::parse(DEFAULT_REPORT_URL).expect("default report url is valid"),
            flush_interval_ms: 5_000,
            page_size: 2_000,
            max_value_length: 240,
        }
    }
}

impl ReportingSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}
