//! Memory Cache Facade
//!
//! The public face of the engine: one named logical cache whose keys are
//! spread over independent containers by a seeded hash.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::{
    check_trim_percent, collect_values, CacheContainer, CacheEntry, CachePolicy, CacheStats,
    ContainerSettings, EntryChangeMonitor, MIN_TRIM_OCCUPANCY,
};
use crate::config::{CacheConfig, DEFAULT_CACHE_NAME};
use crate::error::{CacheError, Result};

/// Names of the caches currently alive in this process, lowercased.
fn registry() -> &'static Mutex<HashSet<String>> {
    static NAMES: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    NAMES.get_or_init(|| Mutex::new(HashSet::new()))
}

// == Shard Selection ==
/// Deterministic key → shard mapping using a seeded `DefaultHasher`.
#[derive(Debug, Clone, Copy)]
struct ShardSelector {
    shards: usize,
    seed: u64,
}

impl ShardSelector {
    fn new(shards: usize, seed: u64) -> Self {
        Self {
            shards: shards.max(1),
            seed,
        }
    }

    fn shard_for_key(&self, key: &str) -> usize {
        if self.shards == 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        key.hash(&mut hasher);
        (hasher.finish() % self.shards as u64) as usize
    }
}

// == Memory Cache ==
/// A named, sharded in-process object cache.
///
/// Names are unique among live instances (case-insensitive) and released when
/// the instance is dropped. The name `default` is reserved for
/// [`MemoryCache::new_default`].
pub struct MemoryCache<V> {
    config: CacheConfig,
    shards: Vec<CacheContainer<V>>,
    selector: ShardSelector,
}

impl<V> MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    // == Constructors ==
    /// Creates a cache with the given configuration.
    ///
    /// # Errors
    /// - `InvalidArgument` if the name is empty or `default`
    /// - `InvalidConfiguration` if a limit is out of range
    /// - `DuplicateName` if a live cache already uses the name
    pub fn new(config: CacheConfig) -> Result<Self> {
        if config.name.trim().eq_ignore_ascii_case(DEFAULT_CACHE_NAME) {
            return Err(CacheError::InvalidArgument(format!(
                "the cache name '{}' is reserved",
                config.name
            )));
        }
        Self::build(config)
    }

    /// Creates a cache named `name` with default limits.
    pub fn with_name(name: impl Into<String>) -> Result<Self> {
        Self::new(CacheConfig::new(name))
    }

    /// Creates the process default cache, named `Default`.
    ///
    /// Only one may be alive at a time.
    pub fn new_default() -> Result<Self> {
        Self::build(CacheConfig::default())
    }

    fn build(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let registered = config.name.trim().to_lowercase();
        if !registry().lock().insert(registered) {
            return Err(CacheError::DuplicateName(config.name));
        }

        let per_shard = config
            .max_entries
            .map(|max| max.div_ceil(config.shard_count));
        let shards = (0..config.shard_count)
            .map(|index| {
                CacheContainer::new(ContainerSettings {
                    label: format!("{}#{}", config.name, index),
                    polling_interval: config.polling_interval,
                    max_entries: per_shard,
                })
            })
            .collect();
        let selector = ShardSelector::new(config.shard_count, seed_for(&config.name));

        info!(
            "Created cache '{}': shards={}, max_entries={:?}, polling_interval={:?}",
            config.name, config.shard_count, config.max_entries, config.polling_interval
        );
        Ok(Self {
            config,
            shards,
            selector,
        })
    }

    fn shard(&self, key: &str) -> &CacheContainer<V> {
        &self.shards[self.selector.shard_for_key(key)]
    }

    // == Reads ==
    /// Returns the value under `key`, or None if absent or expired.
    pub fn get(&self, key: &str) -> Option<V> {
        self.shard(key).get(key)
    }

    /// True if a live entry exists. Does not count as an access.
    pub fn contains(&self, key: &str) -> bool {
        self.shard(key).contains(key)
    }

    /// Looks up several keys at once; missing keys are left out.
    pub fn get_values<'a, I>(&self, keys: I) -> HashMap<String, V>
    where
        I: IntoIterator<Item = &'a str>,
    {
        collect_values(keys, |key| self.get(key))
    }

    // == Writes ==
    /// Inserts only if no live entry exists. Returns false otherwise.
    pub fn add(&self, key: impl Into<String>, value: V, policy: CachePolicy<V>) -> Result<bool> {
        let key = key.into();
        self.shard(&key).add(key, value, policy)
    }

    /// Inserts unless a live entry exists, in which case its value is returned.
    pub fn add_or_get_existing(
        &self,
        key: impl Into<String>,
        value: V,
        policy: CachePolicy<V>,
    ) -> Result<Option<V>> {
        let key = key.into();
        self.shard(&key).add_or_get_existing(key, value, policy)
    }

    /// Inserts or overwrites the entry under `key`.
    pub fn set(&self, key: impl Into<String>, value: V, policy: CachePolicy<V>) -> Result<()> {
        let key = key.into();
        self.shard(&key).set(key, value, policy)
    }

    /// Removes the entry under `key`, returning its value if it was live.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.shard(key).remove(key)
    }

    /// Re-applies the sliding window of the entry under `key`.
    pub fn refresh(&self, key: &str) -> bool {
        self.shard(key).refresh(key)
    }

    // == Trim ==
    /// Removes `percent` of the entries of the whole cache.
    ///
    /// The goal is `get_count() * percent / 100`. Expired entries of every
    /// shard go first and count towards it. The remainder is evicted in
    /// cache-wide LRU order, skipping `NotRemovable` entries, unless the cache
    /// holds `MIN_TRIM_OCCUPANCY` live entries or fewer. Returns the number
    /// of entries removed.
    pub fn trim(&self, percent: u8) -> Result<usize> {
        check_trim_percent(percent)?;
        let goal = self.get_count() * usize::from(percent) / 100;
        if goal == 0 {
            return Ok(0);
        }

        let expired: usize = self.shards.iter().map(CacheContainer::trim_expired).sum();
        let mut evicted = 0;
        if expired < goal && self.get_count() > MIN_TRIM_OCCUPANCY {
            for (shard, victims) in self.shards.iter().zip(self.pick_lru(goal - expired)) {
                if !victims.is_empty() {
                    evicted += shard.trim_entries(victims);
                }
            }
        }

        let removed = expired + evicted;
        info!(
            "Trim {}% of cache '{}': removed {} entries ({} expired, {} evicted)",
            percent, self.config.name, removed, expired, evicted
        );
        Ok(removed)
    }

    /// The `count` least recently used removable entries across all shards,
    /// grouped by shard index.
    fn pick_lru(&self, count: usize) -> Vec<Vec<Arc<CacheEntry<V>>>> {
        let mut candidates: Vec<(u64, usize, Arc<CacheEntry<V>>)> = self
            .shards
            .iter()
            .enumerate()
            .flat_map(|(index, shard)| {
                shard
                    .lru_candidates(count)
                    .into_iter()
                    .map(move |(stamp, entry)| (stamp, index, entry))
            })
            .collect();
        candidates.sort_unstable_by_key(|(stamp, _, _)| *stamp);
        candidates.truncate(count);

        let mut picked = vec![Vec::new(); self.shards.len()];
        for (_, index, entry) in candidates {
            picked[index].push(entry);
        }
        picked
    }

    // == Change Monitors ==
    /// Creates a monitor that changes when any of `keys` is removed or replaced.
    ///
    /// If one of the keys has no live entry the monitor starts out changed.
    pub fn create_entry_change_monitor<'a, I>(&self, keys: I) -> Result<EntryChangeMonitor>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let keys: Vec<String> = keys.into_iter().map(str::to_string).collect();
        if keys.is_empty() {
            return Err(CacheError::InvalidArgument(
                "an entry change monitor needs at least one key".to_string(),
            ));
        }

        let monitor = EntryChangeMonitor::new(keys);
        let mut all_present = true;
        for key in monitor.cache_keys() {
            all_present &= self.shard(key).attach_dependent(key, monitor.signal_handle());
        }
        if !all_present {
            monitor.signal_handle().signal();
        }
        Ok(monitor)
    }

    // == Introspection ==
    /// Number of entries across all shards, including expired ones not yet swept.
    pub fn get_count(&self) -> usize {
        self.shards.iter().map(CacheContainer::len).sum()
    }

    /// Aggregated counters of every shard.
    pub fn stats(&self) -> CacheStats {
        self.shards.iter().fold(CacheStats::new(), |mut total, shard| {
            total.merge(&shard.stats());
            total
        })
    }
}

impl<V> MemoryCache<V> {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn cache_memory_limit_megabytes(&self) -> u64 {
        self.config.cache_memory_limit_megabytes
    }

    pub fn physical_memory_limit_percentage(&self) -> u8 {
        self.config.physical_memory_limit_percentage
    }

    pub fn polling_interval(&self) -> Duration {
        self.config.polling_interval
    }
}

impl<V> Drop for MemoryCache<V> {
    fn drop(&mut self) {
        registry()
            .lock()
            .remove(&self.config.name.trim().to_lowercase());
        debug!("Released cache name '{}'", self.config.name);
    }
}

impl<V> fmt::Debug for MemoryCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("name", &self.config.name)
            .field("shards", &self.shards.len())
            .finish()
    }
}

fn seed_for(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.to_lowercase().hash(&mut hasher);
    hasher.finish()
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ChangeMonitor;

    fn cache(name: &str) -> MemoryCache<String> {
        MemoryCache::new(CacheConfig::new(name).with_shard_count(4)).unwrap()
    }

    #[test]
    fn test_shard_selector_is_deterministic() {
        let selector = ShardSelector::new(8, 42);
        let shard = selector.shard_for_key("user:123");
        assert!(shard < 8);
        assert_eq!(selector.shard_for_key("user:123"), shard);
        assert_eq!(ShardSelector::new(1, 7).shard_for_key("anything"), 0);
    }

    #[test]
    fn test_reserved_name_is_rejected() {
        for name in ["default", "Default", "DEFAULT"] {
            let result = MemoryCache::<String>::with_name(name);
            assert!(matches!(result, Err(CacheError::InvalidArgument(_))));
        }
    }

    #[test]
    fn test_empty_name_is_rejected() {
        assert!(MemoryCache::<String>::with_name("").is_err());
    }

    #[test]
    fn test_duplicate_name_until_dropped() {
        let first = cache("facade_dup");
        let second = MemoryCache::<String>::with_name("FACADE_DUP");
        assert!(matches!(second, Err(CacheError::DuplicateName(_))));

        drop(first);
        assert!(MemoryCache::<String>::with_name("facade_dup").is_ok());
    }

    #[test]
    fn test_operations_route_to_one_shard() {
        let cache = cache("facade_routing");
        for i in 0..50 {
            cache.set(format!("key{}", i), format!("value{}", i), CachePolicy::new()).unwrap();
        }

        assert_eq!(cache.get_count(), 50);
        for i in 0..50 {
            assert_eq!(cache.get(&format!("key{}", i)), Some(format!("value{}", i)));
        }
        assert_eq!(cache.remove("key7"), Some("value7".to_string()));
        assert!(!cache.contains("key7"));
        assert_eq!(cache.get_count(), 49);
        assert_eq!(cache.stats().hits, 50);
    }

    #[test]
    fn test_add_and_add_or_get_existing() {
        let cache = cache("facade_add");
        assert!(cache.add("k", "a".to_string(), CachePolicy::new()).unwrap());
        assert!(!cache.add("k", "b".to_string(), CachePolicy::new()).unwrap());
        assert_eq!(
            cache.add_or_get_existing("k", "c".to_string(), CachePolicy::new()).unwrap(),
            Some("a".to_string())
        );
    }

    #[test]
    fn test_trim_rejects_bad_percentage() {
        let cache = cache("facade_trim_bad");
        assert!(cache.trim(101).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_trim_applies_one_goal_across_shards() {
        let cache: MemoryCache<u32> =
            MemoryCache::new(CacheConfig::new("facade_trim_sharded").with_shard_count(4))
                .unwrap();
        for i in 0..12 {
            cache.set(format!("k{:02}", i), i, CachePolicy::new()).unwrap();
        }
        for i in 0..3 {
            assert!(cache.get(&format!("k{:02}", i)).is_some());
        }

        assert_eq!(cache.trim(50).unwrap(), 6);
        assert_eq!(cache.get_count(), 6);
        let survivors: Vec<u32> = (0..12)
            .filter(|i| cache.contains(&format!("k{:02}", i)))
            .collect();
        assert_eq!(survivors, vec![0, 1, 2, 9, 10, 11]);
        assert_eq!(cache.stats().trims, 6);
    }

    #[test]
    fn test_trim_leaves_small_sharded_cache_alone() {
        let cache: MemoryCache<u32> =
            MemoryCache::new(CacheConfig::new("facade_trim_floor").with_shard_count(4))
                .unwrap();
        for i in 0..MIN_TRIM_OCCUPANCY {
            cache.set(format!("k{}", i), i as u32, CachePolicy::new()).unwrap();
        }

        assert_eq!(cache.trim(100).unwrap(), 0);
        assert_eq!(cache.get_count(), MIN_TRIM_OCCUPANCY);
    }

    #[test]
    fn test_get_values_spans_shards() {
        let cache = cache("facade_get_values");
        cache.set("a", "1".to_string(), CachePolicy::new()).unwrap();
        cache.set("b", "2".to_string(), CachePolicy::new()).unwrap();

        let values = cache.get_values(["a", "b", "missing"]);
        assert_eq!(values.len(), 2);
        assert_eq!(values["a"], "1");
        assert_eq!(values["b"], "2");
    }

    #[test]
    fn test_max_entries_split_across_shards() {
        let config = CacheConfig::new("facade_max")
            .with_shard_count(2)
            .with_max_entries(10);
        let cache: MemoryCache<u32> = MemoryCache::new(config).unwrap();
        for i in 0..100 {
            cache.set(format!("k{}", i), i, CachePolicy::new()).unwrap();
        }
        assert!(cache.get_count() <= 10);
        assert!(cache.stats().evictions >= 90);
    }

    #[test]
    fn test_entry_change_monitor_fires_on_remove() {
        let cache = cache("facade_monitor");
        cache.set("a", "1".to_string(), CachePolicy::new()).unwrap();
        cache.set("b", "2".to_string(), CachePolicy::new()).unwrap();

        let monitor = cache.create_entry_change_monitor(["a", "b"]).unwrap();
        assert!(!monitor.has_changed());

        cache.remove("b");
        assert!(monitor.has_changed());
    }

    #[test]
    fn test_entry_change_monitor_for_missing_key_starts_changed() {
        let cache = cache("facade_monitor_missing");
        cache.set("a", "1".to_string(), CachePolicy::new()).unwrap();

        let monitor = cache.create_entry_change_monitor(["a", "missing"]).unwrap();
        assert!(monitor.has_changed());
        assert!(cache.create_entry_change_monitor([]).is_err());
    }

    #[test]
    fn test_limit_getters() {
        let config = CacheConfig::new("facade_limits")
            .with_memory_limits(64, 40)
            .with_polling_interval(Duration::from_secs(5));
        let cache: MemoryCache<u32> = MemoryCache::new(config).unwrap();

        assert_eq!(cache.name(), "facade_limits");
        assert_eq!(cache.cache_memory_limit_megabytes(), 64);
        assert_eq!(cache.physical_memory_limit_percentage(), 40);
        assert_eq!(cache.polling_interval(), Duration::from_secs(5));
    }
}
