//! Cache Container Module
//!
//! Main cache engine combining the key map with the expiration queue, the
//! recency index and the background sweep timer.
//!
//! One `parking_lot::RwLock` guards all of that state. Reads run under the
//! shared section; everything that mutates the map runs under the exclusive
//! one. The queue and index carry their own inner locks, always taken after
//! the container lock. Removal callbacks, change monitor subscriptions and
//! update callbacks are collected while the lock is held and fired after it
//! is released, so an observer may call back into the cache freely.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::cache::entry::{RemovalNotice, Superseded};
use crate::cache::{
    collect_values, CacheCounters, CacheEntry, CachePolicy, CacheStats, ExpirationQueue,
    RecencyIndex, RemovedReason, SignaledChangeMonitor,
};
use crate::config::DEFAULT_POLLING_INTERVAL;
use crate::error::{CacheError, Result};
use crate::tasks::SweepTimer;

/// Tombstone slack tolerated in the expiration queue before a sweep compacts it.
const COMPACTION_SLACK: usize = 64;

/// Per-container settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSettings {
    /// Name used in log lines
    pub label: String,
    /// Interval between background sweeps
    pub polling_interval: Duration,
    /// Entry limit enforced on insert, None = unbounded
    pub max_entries: Option<usize>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            label: "container".to_string(),
            polling_interval: DEFAULT_POLLING_INTERVAL,
            max_entries: None,
        }
    }
}

struct State<V> {
    entries: HashMap<String, Arc<CacheEntry<V>>>,
    expiration: ExpirationQueue<V>,
    recency: RecencyIndex<V>,
    /// Live entries that carry a deadline
    expirable: usize,
    sweeper: SweepTimer,
}

struct Shared<V> {
    state: RwLock<State<V>>,
    counters: CacheCounters,
    settings: ContainerSettings,
    runtime: Option<Handle>,
}

/// Side effects owed once the container lock is released.
#[must_use]
struct Deferred<V> {
    removals: Vec<RemovalNotice<V>>,
    superseded: Vec<Superseded>,
    added: Vec<Arc<CacheEntry<V>>>,
}

impl<V> Default for Deferred<V> {
    fn default() -> Self {
        Self {
            removals: Vec::new(),
            superseded: Vec::new(),
            added: Vec::new(),
        }
    }
}

// == Cache Container ==
/// Concurrent key → entry store with lazy and background expiration and
/// LRU/TTL trimming.
///
/// Cloning is cheap and yields a handle to the same container.
pub struct CacheContainer<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for CacheContainer<V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<V> CacheContainer<V>
where
    V: Clone + Send + Sync + 'static,
{
    // == Constructor ==
    /// Creates an empty container.
    ///
    /// The background sweep runs on the tokio runtime current at construction,
    /// if any.
    pub fn new(settings: ContainerSettings) -> Self {
        Self::with_runtime(settings, Handle::try_current().ok())
    }

    /// Creates an empty container whose sweep runs on `runtime`.
    pub fn with_runtime(settings: ContainerSettings, runtime: Option<Handle>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    entries: HashMap::new(),
                    expiration: ExpirationQueue::new(),
                    recency: RecencyIndex::new(),
                    expirable: 0,
                    sweeper: SweepTimer::new(),
                }),
                counters: CacheCounters::new(),
                settings,
                runtime,
            }),
        }
    }

    // == Get ==
    /// Retrieves a value by key.
    ///
    /// An expired entry is removed on the spot (`Expired`) and reported as a
    /// miss, whether or not the sweep has run.
    pub fn get(&self, key: &str) -> Option<V> {
        self.shared.get(key)
    }

    /// Same lazy expiration as `get`, without touching recency or counters.
    pub fn contains(&self, key: &str) -> bool {
        self.shared.contains(key)
    }

    /// Looks up several keys; missing or expired keys are left out.
    pub fn get_values<'a, I>(&self, keys: I) -> HashMap<String, V>
    where
        I: IntoIterator<Item = &'a str>,
    {
        collect_values(keys, |key| self.get(key))
    }

    // == Add Or Get Existing ==
    /// Inserts unless a live entry exists; first writer wins.
    ///
    /// Returns the existing value, or None if the new entry was stored.
    pub fn add_or_get_existing(
        &self,
        key: impl Into<String>,
        value: V,
        policy: CachePolicy<V>,
    ) -> Result<Option<V>> {
        self.shared.add_or_get_existing(key.into(), value, policy)
    }

    /// Strict add: returns false if the key already holds a live entry.
    pub fn add(&self, key: impl Into<String>, value: V, policy: CachePolicy<V>) -> Result<bool> {
        Ok(self.add_or_get_existing(key, value, policy)?.is_none())
    }

    // == Set ==
    /// Unconditional upsert.
    ///
    /// An existing entry is updated in place: value, expiration, priority,
    /// callbacks and change monitors are replaced and its recency and
    /// expiration bookkeeping re-applied.
    pub fn set(&self, key: impl Into<String>, value: V, policy: CachePolicy<V>) -> Result<()> {
        self.shared.set(key.into(), value, policy)
    }

    // == Remove ==
    /// Removes an entry and returns its value, firing `Removed`.
    ///
    /// An entry that had already expired is removed as `Expired` and None is
    /// returned.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.shared.remove(key)
    }

    /// Re-applies a sliding expiration window from now.
    ///
    /// Returns false if the key is absent, expired, or not sliding.
    pub fn refresh(&self, key: &str) -> bool {
        self.shared.refresh(key)
    }

    // == Trim ==
    /// Removes `percent` of the current entries.
    ///
    /// Expired entries are taken first from the expiration queue; any
    /// shortfall is evicted in LRU order, skipping `NotRemovable` entries.
    /// Returns the number of entries removed.
    pub fn trim(&self, percent: u8) -> Result<usize> {
        check_trim_percent(percent)?;
        Ok(self.shared.trim(percent))
    }

    /// Removes every expired entry the queue yields, counted as trimmed.
    pub(crate) fn trim_expired(&self) -> usize {
        self.shared.trim_expired()
    }

    /// Up to `limit` least recently used removable entries with their
    /// process-wide access stamps, oldest first.
    pub(crate) fn lru_candidates(&self, limit: usize) -> Vec<(u64, Arc<CacheEntry<V>>)> {
        self.shared.state.read().recency.oldest_removable(limit)
    }

    /// Evicts the given entries, skipping any that were replaced or removed
    /// since they were picked. Returns how many were evicted.
    pub(crate) fn trim_entries(&self, victims: Vec<Arc<CacheEntry<V>>>) -> usize {
        self.shared.trim_entries(victims)
    }

    /// Runs one expiration sweep now. Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    /// Registers `monitor` to be signalled when the entry under `key` is
    /// removed or replaced. Returns false if there is no live entry.
    pub fn attach_dependent(&self, key: &str, monitor: &Arc<SignaledChangeMonitor>) -> bool {
        let state = self.shared.state.read();
        match state.entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                entry.add_dependent(Arc::downgrade(monitor));
                true
            }
            _ => false,
        }
    }

    // == Length ==
    /// Number of entries in the map, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.shared.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counters plus the entry count.
    pub fn stats(&self) -> CacheStats {
        let total = self.len();
        self.shared.counters.snapshot(total)
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.shared.settings
    }

    /// True while the background sweep task is running.
    pub fn is_sweep_armed(&self) -> bool {
        self.shared.state.read().sweeper.is_armed()
    }
}

#[cfg(test)]
impl<V> CacheContainer<V> {
    pub(crate) fn recency_keys(&self) -> Vec<String> {
        self.shared.state.read().recency.keys_oldest_first()
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.shared.state.read().expiration.len()
    }

    /// Asserts the map / index / queue bookkeeping agrees.
    pub(crate) fn debug_validate_invariants(&self) {
        let state = self.shared.state.read();
        assert_eq!(state.recency.len(), state.entries.len());
        let mut expirable = 0;
        for (key, entry) in &state.entries {
            assert_eq!(key, entry.key());
            assert!(!entry.is_disabled(), "disabled entry '{}' still mapped", key);
            assert!(state.recency.contains(entry));
            if entry.expires_at().is_some() {
                expirable += 1;
            }
        }
        assert_eq!(state.expirable, expirable);
        assert!(state.expiration.len() >= expirable);
        state.expiration.debug_validate_invariants();
    }
}

impl<V> Shared<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(self: &Arc<Self>, key: &str) -> Option<V> {
        let expired = {
            let state = self.state.read();
            match state.entries.get(key) {
                Some(entry) if !entry.is_expired() => {
                    state.recency.touch(entry);
                    let value = entry.value();
                    self.counters.record_hit();
                    return Some(value);
                }
                Some(entry) => Some(entry.clone()),
                None => None,
            }
        };
        self.counters.record_miss();
        if let Some(entry) = expired {
            self.expire(&entry);
        }
        None
    }

    fn contains(self: &Arc<Self>, key: &str) -> bool {
        let expired = {
            let state = self.state.read();
            match state.entries.get(key) {
                Some(entry) if !entry.is_expired() => return true,
                Some(entry) => entry.clone(),
                None => return false,
            }
        };
        self.expire(&expired);
        false
    }

    /// Removes an entry found expired under the read section.
    ///
    /// The write section re-checks that the map still holds this very entry
    /// and that it is still expired, so a writer that replaced or refreshed
    /// it in between is never undone.
    fn expire(self: &Arc<Self>, entry: &Arc<CacheEntry<V>>) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.write();
            if is_current(&state, entry) && entry.is_expired() {
                self.unlink(&mut state, entry, RemovedReason::Expired, &mut deferred);
            }
        }
        self.run(deferred);
    }

    fn add_or_get_existing(
        self: &Arc<Self>,
        key: String,
        value: V,
        policy: CachePolicy<V>,
    ) -> Result<Option<V>> {
        let entry = Arc::new(CacheEntry::new(key, value, policy)?);
        let mut deferred = Deferred::default();
        let existing = {
            let mut state = self.state.write();
            match state.entries.get(entry.key()).cloned() {
                Some(current) if !current.is_expired() => Some(current.value()),
                stale => {
                    if let Some(stale) = stale {
                        self.unlink(&mut state, &stale, RemovedReason::Expired, &mut deferred);
                    }
                    self.insert_new(&mut state, entry, &mut deferred);
                    None
                }
            }
        };
        self.run(deferred);
        Ok(existing)
    }

    fn set(self: &Arc<Self>, key: String, value: V, policy: CachePolicy<V>) -> Result<()> {
        policy.validate()?;
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.write();
            match state.entries.get(&key).cloned() {
                Some(existing) => {
                    let had_deadline = existing.expires_at().is_some();
                    deferred.superseded.push(existing.update(value, policy));
                    state.recency.touch(&existing);
                    let has_deadline = state.expiration.enqueue(&existing);
                    match (had_deadline, has_deadline) {
                        (false, true) => state.expirable += 1,
                        (true, false) => state.expirable -= 1,
                        _ => {}
                    }
                    if has_deadline {
                        self.arm(&mut state);
                    } else if state.expirable == 0 {
                        disarm(&mut state);
                    }
                    debug!("Updated entry '{}' in place", existing.key());
                    deferred.added.push(existing);
                }
                None => {
                    let entry = Arc::new(CacheEntry::new(key, value, policy)?);
                    self.insert_new(&mut state, entry, &mut deferred);
                }
            }
        }
        self.run(deferred);
        Ok(())
    }

    fn remove(self: &Arc<Self>, key: &str) -> Option<V> {
        let mut deferred = Deferred::default();
        let removed = {
            let mut state = self.state.write();
            match state.entries.get(key).cloned() {
                Some(entry) if entry.is_expired() => {
                    self.unlink(&mut state, &entry, RemovedReason::Expired, &mut deferred);
                    None
                }
                Some(entry) => {
                    let value = entry.value();
                    self.unlink(&mut state, &entry, RemovedReason::Removed, &mut deferred);
                    Some(value)
                }
                None => None,
            }
        };
        self.run(deferred);
        removed
    }

    fn refresh(self: &Arc<Self>, key: &str) -> bool {
        let mut state = self.state.write();
        let Some(entry) = state.entries.get(key).cloned() else {
            return false;
        };
        if entry.is_expired() || !entry.refresh_sliding() {
            return false;
        }
        state.recency.touch(&entry);
        state.expiration.enqueue(&entry);
        self.arm(&mut state);
        true
    }

    fn trim(self: &Arc<Self>, percent: u8) -> usize {
        let mut deferred = Deferred::default();
        let (expired, evicted) = {
            let mut state = self.state.write();
            let goal = state.entries.len() * usize::from(percent) / 100;
            if goal == 0 {
                return 0;
            }

            let expired = self.drain_expired(&mut state, &mut deferred);
            let mut evicted = 0;
            if expired < goal {
                for victim in state.recency.evict_up_to(goal - expired) {
                    if is_current(&state, &victim) {
                        self.unlink(&mut state, &victim, RemovedReason::Evicted, &mut deferred);
                        evicted += 1;
                    }
                }
            }
            (expired, evicted)
        };
        self.run(deferred);

        let removed = expired + evicted;
        self.counters.record_trimmed(removed);
        info!(
            "Trim {}% of '{}': removed {} entries ({} expired, {} evicted)",
            percent, self.settings.label, removed, expired, evicted
        );
        removed
    }

    fn trim_expired(self: &Arc<Self>) -> usize {
        let mut deferred = Deferred::default();
        let expired = {
            let mut state = self.state.write();
            self.drain_expired(&mut state, &mut deferred)
        };
        self.run(deferred);
        self.counters.record_trimmed(expired);
        expired
    }

    fn trim_entries(self: &Arc<Self>, victims: Vec<Arc<CacheEntry<V>>>) -> usize {
        let mut deferred = Deferred::default();
        let evicted = {
            let mut state = self.state.write();
            let mut evicted = 0;
            for victim in victims {
                if is_current(&state, &victim) {
                    self.unlink(&mut state, &victim, RemovedReason::Evicted, &mut deferred);
                    evicted += 1;
                }
            }
            evicted
        };
        self.run(deferred);
        self.counters.record_trimmed(evicted);
        debug!("Trim of '{}': evicted {} entries", self.settings.label, evicted);
        evicted
    }

    fn sweep(self: &Arc<Self>) -> usize {
        let mut deferred = Deferred::default();
        let removed = {
            let mut state = self.state.write();
            let removed = self.drain_expired(&mut state, &mut deferred);
            if state.expirable == 0 {
                disarm(&mut state);
            } else if state.expiration.len() > 2 * state.expirable + COMPACTION_SLACK {
                let dropped = state.expiration.compact();
                debug!("Compacted expiration queue: dropped {} tombstones", dropped);
            }
            removed
        };
        self.run(deferred);

        if removed > 0 {
            info!(
                "Expiration sweep of '{}': removed {} expired entries",
                self.settings.label, removed
            );
        } else {
            debug!("Expiration sweep of '{}': no expired entries found", self.settings.label);
        }
        removed
    }

    /// Removes an entry whose change monitor fired, if it was not replaced since.
    fn invalidate(self: &Arc<Self>, entry: &Arc<CacheEntry<V>>, generation: u64) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.write();
            if is_current(&state, entry) && entry.generation() == generation {
                self.unlink(&mut state, entry, RemovedReason::DependencyChanged, &mut deferred);
            }
        }
        self.run(deferred);
    }

    // == Bookkeeping (write section held) ==
    /// Removes every entry whose queued deadline has passed.
    fn drain_expired(&self, state: &mut State<V>, deferred: &mut Deferred<V>) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        while let Some(entry) = state.expiration.dequeue_expired(now) {
            if is_current(state, &entry) {
                self.unlink(state, &entry, RemovedReason::Expired, deferred);
                removed += 1;
            }
        }
        removed
    }

    fn insert_new(
        self: &Arc<Self>,
        state: &mut State<V>,
        entry: Arc<CacheEntry<V>>,
        deferred: &mut Deferred<V>,
    ) {
        if let Some(max) = self.settings.max_entries {
            while state.entries.len() >= max {
                let Some(victim) = state.recency.pop_lru() else {
                    break;
                };
                debug!("Evicting '{}' to stay within {} entries", victim.key(), max);
                self.unlink(state, &victim, RemovedReason::Evicted, deferred);
            }
        }

        state.entries.insert(entry.key().to_string(), entry.clone());
        state.recency.touch(&entry);
        if state.expiration.enqueue(&entry) {
            state.expirable += 1;
            self.arm(state);
        }
        deferred.added.push(entry);
    }

    /// Takes an entry out of every structure and marks it removed.
    fn unlink(
        &self,
        state: &mut State<V>,
        entry: &Arc<CacheEntry<V>>,
        reason: RemovedReason,
        deferred: &mut Deferred<V>,
    ) {
        if is_current(state, entry) {
            state.entries.remove(entry.key());
        }
        state.recency.remove(entry);
        if entry.expires_at().is_some() && !entry.is_disabled() {
            state.expirable = state.expirable.saturating_sub(1);
        }
        if let Some(notice) = entry.mark_removed(reason) {
            self.counters.record_removal(reason);
            deferred.removals.push(notice);
        }
        if state.expirable == 0 {
            disarm(state);
        }
    }

    fn arm(self: &Arc<Self>, state: &mut State<V>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        state.sweeper.arm(
            self.runtime.as_ref(),
            self.settings.polling_interval,
            &self.settings.label,
            move || match weak.upgrade() {
                Some(shared) => {
                    shared.sweep();
                    true
                }
                None => false,
            },
        );
    }

    // == Deferred Effects (no lock held) ==
    //
    // New subscriptions go first: a monitor shared with a superseded or
    // removed entry is only disposed once its last registration is released.
    fn run(self: &Arc<Self>, deferred: Deferred<V>) {
        for entry in deferred.added {
            let weak: Weak<Self> = Arc::downgrade(self);
            entry.mark_added(move |entry: &Arc<CacheEntry<V>>, generation| {
                if let Some(shared) = weak.upgrade() {
                    shared.invalidate(entry, generation);
                }
            });
        }
        for superseded in deferred.superseded {
            superseded.fire();
        }
        for notice in deferred.removals {
            let key = notice.key().to_string();
            if let Some(update) = notice.fire() {
                if let Err(err) = self.set(key.clone(), update.value, update.policy) {
                    warn!("Discarding update supplied for '{}': {}", key, err);
                }
            }
        }
    }
}

/// Rejects trim percentages above 100.
pub(crate) fn check_trim_percent(percent: u8) -> Result<()> {
    if percent > 100 {
        return Err(CacheError::InvalidArgument(format!(
            "trim percentage must be between 0 and 100, got {}",
            percent
        )));
    }
    Ok(())
}

fn is_current<V>(state: &State<V>, entry: &Arc<CacheEntry<V>>) -> bool {
    state
        .entries
        .get(entry.key())
        .is_some_and(|mapped| Arc::ptr_eq(mapped, entry))
}

/// Drops every queued slot and stops the sweep once nothing can expire.
fn disarm<V>(state: &mut State<V>) {
    state.expiration.clear();
    state.sweeper.disarm();
}
