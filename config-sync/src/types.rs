use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Logical clock attached to a configuration snapshot: the time (milliseconds since the
/// unix epoch) at which the snapshot was fetched from the authority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncDate(u64);

impl SyncDate {
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        SyncDate(millis)
    }

    pub const fn from_millis(millis: u64) -> Self {
        SyncDate(millis)
    }

    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed between `self` and a later `now`. Zero if `now` is earlier.
    pub fn age(&self, now: SyncDate) -> Duration {
        Duration::from_millis(now.0.saturating_sub(self.0))
    }
}

impl fmt::Display for SyncDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a storage backend holds: the serialized configuration and its sync date.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub config: String,
    pub sync_date: SyncDate,
}

impl SyncRecord {
    pub fn new<C: Into<String>>(config: C, sync_date: SyncDate) -> Self {
        SyncRecord {
            config: config.into(),
            sync_date,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected an array of flags")]
    NotAnArray,
    #[error("flag at index {0} has no string slug")]
    MissingSlug(usize),
}

/// A flag configuration snapshot. Flag definitions are opaque values keyed by slug,
/// kept in the order the authority returned them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlagConfig {
    flags: IndexMap<String, Value>,
}

impl FlagConfig {
    pub fn empty() -> Self {
        FlagConfig::default()
    }

    /// Builds a configuration from flag definitions. Every definition must be an
    /// object carrying a string `slug`. A repeated slug replaces the earlier definition.
    pub fn from_flags(flags: Vec<Value>) -> Result<Self, ConfigParseError> {
        let mut map = IndexMap::with_capacity(flags.len());
        for (idx, flag) in flags.into_iter().enumerate() {
            let slug = flag
                .get("slug")
                .and_then(Value::as_str)
                .ok_or(ConfigParseError::MissingSlug(idx))?
                .to_string();
            map.insert(slug, flag);
        }
        Ok(FlagConfig { flags: map })
    }

    /// Parses the serialized form produced by [`FlagConfig::to_json`].
    pub fn parse(serialized: &str) -> Result<Self, ConfigParseError> {
        match serde_json::from_str::<Value>(serialized)? {
            Value::Array(flags) => FlagConfig::from_flags(flags),
            _ => Err(ConfigParseError::NotAnArray),
        }
    }

    /// Serializes the configuration as a JSON array of flag definitions.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.flags.values().collect::<Vec<_>>())
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.flags.keys().map(String::as_str)
    }

    pub fn flags(&self) -> impl Iterator<Item = &Value> {
        self.flags.values()
    }

    /// Compares `self` (the previous snapshot) with `next`.
    pub fn diff(&self, next: &FlagConfig) -> ConfigDiff {
        let mut diff = ConfigDiff::default();

        for (slug, flag) in &next.flags {
            match self.flags.get(slug) {
                None => diff.new_flags.push(slug.clone()),
                Some(previous) if previous != flag => diff.updated_flags.push(slug.clone()),
                Some(_) => {}
            }
        }

        for slug in self.flags.keys() {
            if !next.flags.contains_key(slug) {
                diff.deleted_flags.push(slug.clone());
            }
        }

        diff
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct ConfigDiff {
    pub new_flags: Vec<String>,
    pub deleted_flags: Vec<String>,
    pub updated_flags: Vec<String>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.new_flags.is_empty() && self.deleted_flags.is_empty() && self.updated_flags.is_empty()
    }
}
