//! Usage reporting: aggregates which context properties, values and flag outcomes were
//! seen, and periodically ships them upstream.

pub mod aggregator;
pub mod config;
mod flusher;
pub mod metrics_defs;
pub mod protocol;
pub mod sink;

#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use aggregator::{FlushSummary, ReportingAggregator, UsageEvent};
pub use flusher::FlushTask;
