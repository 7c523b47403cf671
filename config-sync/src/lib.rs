//! Keeps a local copy of the flag configuration in sync with the authority, using the
//! configured storage backends as fallback and as a durable cache.

pub mod authority;
pub mod config;
pub mod engine;
pub mod health;
pub mod metrics_defs;
pub mod readiness;
pub mod storage;
mod synchronizer;
pub mod types;

#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use synchronizer::{ConfigSource, ConfigSync, SyncError};
