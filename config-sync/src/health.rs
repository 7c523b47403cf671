use crate::types::SyncDate;
use std::time::Duration;

/// Value reported by the config age gauge when no sync ever succeeded.
pub const NEVER_SYNCED_AGE_MS: f64 = 999_999_999.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Health {
    Healthy,
    NeverSynced,
    Stale { age: Duration },
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }

    pub fn message(&self) -> &'static str {
        match self {
            Health::Healthy => "OK",
            Health::NeverSynced => "No successful config sync yet",
            Health::Stale { .. } => "Last successful config sync is too old",
        }
    }
}

/// Judges the last successful sync against `max_age_ms`. A config exactly `max_age_ms`
/// old is still healthy. A `max_age_ms` of zero or less disables the staleness check.
pub fn evaluate(last_sync: Option<SyncDate>, max_age_ms: i64, now: SyncDate) -> Health {
    let Some(last_sync) = last_sync else {
        return Health::NeverSynced;
    };

    if max_age_ms <= 0 {
        return Health::Healthy;
    }

    let age = last_sync.age(now);
    if age.as_millis() > max_age_ms as u128 {
        Health::Stale { age }
    } else {
        Health::Healthy
    }
}

/// Age in milliseconds of the last successful sync, or [`NEVER_SYNCED_AGE_MS`].
pub fn config_age_ms(last_sync: Option<SyncDate>, now: SyncDate) -> f64 {
    match last_sync {
        Some(last_sync) => last_sync.age(now).as_millis() as f64,
        None => NEVER_SYNCED_AGE_MS,
    }
}
