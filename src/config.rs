//! Configuration Module
//!
//! Handles building and validating cache configuration from explicit values,
//! name/value pairs, or environment variables.

use std::env;
use std::num::NonZeroUsize;
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Name reserved for the process default cache.
pub const DEFAULT_CACHE_NAME: &str = "Default";

/// Default interval between background expiration sweeps.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(20);

// Keys accepted by `CacheConfig::from_pairs`.
const KEY_MEMORY_LIMIT: &str = "cacheMemoryLimitMegabytes";
const KEY_PHYSICAL_LIMIT: &str = "physicalMemoryLimitPercentage";
const KEY_POLLING_INTERVAL: &str = "pollingInterval";
const KEY_MAX_ENTRIES: &str = "maxEntries";
const KEY_SHARD_COUNT: &str = "shardCount";

/// Cache configuration parameters.
///
/// Memory limits are validated and exposed to callers but the engine does not
/// measure process memory itself; `max_entries` is the limit it enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Logical cache name, unique among live caches
    pub name: String,
    /// Number of independent containers keys are spread over
    pub shard_count: usize,
    /// Maximum number of entries across all shards, None = unbounded
    pub max_entries: Option<usize>,
    /// Memory limit in megabytes, 0 = no limit
    pub cache_memory_limit_megabytes: u64,
    /// Percentage of physical memory the cache may use, 0 = no limit
    pub physical_memory_limit_percentage: u8,
    /// Interval between background expiration sweeps
    pub polling_interval: Duration,
}

impl CacheConfig {
    /// Creates a config with default limits for the given cache name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_memory_limits(mut self, megabytes: u64, physical_percentage: u8) -> Self {
        self.cache_memory_limit_megabytes = megabytes;
        self.physical_memory_limit_percentage = physical_percentage;
        self
    }

    /// Builds a config from name/value pairs, rejecting malformed values.
    ///
    /// # Keys
    /// - `cacheMemoryLimitMegabytes` - non-negative integer
    /// - `physicalMemoryLimitPercentage` - integer in 0..=100
    /// - `pollingInterval` - `HH:MM:SS` or whole seconds, non-zero
    /// - `maxEntries` - positive integer
    /// - `shardCount` - positive integer
    ///
    /// Unknown keys are rejected so that typos do not silently fall back to defaults.
    pub fn from_pairs<'a, I>(name: impl Into<String>, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::new(name);
        for (key, raw) in pairs {
            let raw = raw.trim();
            match key {
                KEY_MEMORY_LIMIT => {
                    config.cache_memory_limit_megabytes = parse_non_negative(key, raw)?;
                }
                KEY_PHYSICAL_LIMIT => {
                    let pct = parse_non_negative(key, raw)?;
                    config.physical_memory_limit_percentage =
                        u8::try_from(pct).map_err(|_| invalid(key, "must be between 0 and 100"))?;
                }
                KEY_POLLING_INTERVAL => {
                    config.polling_interval = parse_interval(key, raw)?;
                }
                KEY_MAX_ENTRIES => {
                    let max = parse_non_negative(key, raw)?;
                    config.max_entries = Some(to_usize(key, max)?);
                }
                KEY_SHARD_COUNT => {
                    let shards = parse_non_negative(key, raw)?;
                    config.shard_count = to_usize(key, shards)?;
                }
                other => return Err(invalid(other, "unknown configuration key")),
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_MEMORY_LIMIT_MEGABYTES`
    /// - `PHYSICAL_MEMORY_LIMIT_PERCENTAGE`
    /// - `POLLING_INTERVAL`
    /// - `MAX_ENTRIES`
    /// - `SHARD_COUNT`
    ///
    /// Unset variables keep their defaults; set but malformed ones are errors.
    pub fn from_env(name: impl Into<String>) -> Result<Self> {
        Self::from_lookup(name, |var| env::var(var).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    fn from_lookup(
        name: impl Into<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let vars = [
            ("CACHE_MEMORY_LIMIT_MEGABYTES", KEY_MEMORY_LIMIT),
            ("PHYSICAL_MEMORY_LIMIT_PERCENTAGE", KEY_PHYSICAL_LIMIT),
            ("POLLING_INTERVAL", KEY_POLLING_INTERVAL),
            ("MAX_ENTRIES", KEY_MAX_ENTRIES),
            ("SHARD_COUNT", KEY_SHARD_COUNT),
        ];
        let values: Vec<(&str, String)> = vars
            .iter()
            .filter_map(|(var, key)| lookup(var).map(|v| (*key, v)))
            .collect();
        Self::from_pairs(name, values.iter().map(|(k, v)| (*k, v.as_str())))
    }

    // == Validate ==
    /// Checks ranges that the typed fields cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CacheError::InvalidArgument(
                "cache name must not be empty".to_string(),
            ));
        }
        if self.shard_count == 0 {
            return Err(invalid(KEY_SHARD_COUNT, "must be at least 1"));
        }
        if self.max_entries == Some(0) {
            return Err(invalid(KEY_MAX_ENTRIES, "must be at least 1"));
        }
        if self.physical_memory_limit_percentage > 100 {
            return Err(invalid(KEY_PHYSICAL_LIMIT, "must be between 0 and 100"));
        }
        if self.polling_interval.is_zero() {
            return Err(invalid(KEY_POLLING_INTERVAL, "must not be zero"));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CACHE_NAME.to_string(),
            shard_count: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            max_entries: None,
            cache_memory_limit_megabytes: 0,
            physical_memory_limit_percentage: 0,
            polling_interval: DEFAULT_POLLING_INTERVAL,
        }
    }
}

// == Parsing Helpers ==
fn invalid(key: &str, reason: &str) -> CacheError {
    CacheError::InvalidConfiguration {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_non_negative(key: &str, raw: &str) -> Result<u64> {
    raw.parse::<u64>()
        .map_err(|_| invalid(key, &format!("'{}' is not a non-negative integer", raw)))
}

fn to_usize(key: &str, value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| invalid(key, "value is too large"))
}

/// Parses `HH:MM:SS` or a whole number of seconds.
fn parse_interval(key: &str, raw: &str) -> Result<Duration> {
    let secs = if raw.contains(':') {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 3 {
            return Err(invalid(key, "expected HH:MM:SS"));
        }
        let hours = parse_non_negative(key, parts[0])?;
        let minutes = parse_non_negative(key, parts[1])?;
        let seconds = parse_non_negative(key, parts[2])?;
        if minutes >= 60 || seconds >= 60 {
            return Err(invalid(key, "minutes and seconds must be below 60"));
        }
        hours * 3600 + minutes * 60 + seconds
    } else {
        parse_non_negative(key, raw)?
    };
    if secs == 0 {
        return Err(invalid(key, "must not be zero"));
    }
    Ok(Duration::from_secs(secs))
}
