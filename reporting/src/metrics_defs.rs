use shared::metrics_defs::{MetricDef, MetricType};

pub const REPORTING_FLUSH_DURATION: MetricDef = MetricDef {
    name: "reporting.flush.duration",
    metric_type: MetricType::Histogram,
    description: "Time to ship one flush cycle in seconds",
};

pub const REPORTING_SEND_FAILURE: MetricDef = MetricDef {
    name: "reporting.send.failure",
    metric_type: MetricType::Counter,
    description: "Report batches dropped because the upstream call failed",
};

pub const ALL_METRICS: &[MetricDef] = &[REPORTING_FLUSH_DURATION, REPORTING_SEND_FAILURE];
