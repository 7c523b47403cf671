//! Metrics definitions for config synchronization.

use shared::metrics_defs::{MetricDef, MetricType};

pub const CONFIG_AGE: MetricDef = MetricDef {
    name: "config.age_ms",
    metric_type: MetricType::Gauge,
    description: "Age in milliseconds of the last successful config sync. 999999999 means the config was never synced",
};

pub const CONFIG_SYNC_DURATION: MetricDef = MetricDef {
    name: "config.sync.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a config fetch cycle in seconds",
};

pub const CONFIG_SYNC_SUCCESS: MetricDef = MetricDef {
    name: "config.sync.success",
    metric_type: MetricType::Counter,
    description: "Fetch cycles that installed a config. Tagged with source",
};

pub const CONFIG_SYNC_FAILURE: MetricDef = MetricDef {
    name: "config.sync.failure",
    metric_type: MetricType::Counter,
    description: "Fetch cycles where neither the authority nor any storage provided a config",
};

pub const STORAGE_WRITE_FAILURE: MetricDef = MetricDef {
    name: "storage.write.failure",
    metric_type: MetricType::Counter,
    description: "Failed write-backs. Tagged with backend",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CONFIG_AGE,
    CONFIG_SYNC_DURATION,
    CONFIG_SYNC_SUCCESS,
    CONFIG_SYNC_FAILURE,
    STORAGE_WRITE_FAILURE,
];
