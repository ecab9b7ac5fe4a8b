//! Cache Entry Module
//!
//! Defines individual cache entries: value, expiration policy, priority,
//! observer callbacks and the change sources an entry depends on.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::cache::monitor::{release, ChangeMonitor, Registration, SignaledChangeMonitor};
use crate::cache::{invoke_guarded, MAX_SLIDING_EXPIRATION};
use crate::error::{CacheError, Result};

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    fn next() -> Self {
        EntryId(NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// == Expiration Policy ==
/// When an entry stops being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    /// The entry only leaves through removal, trim or a dependency change
    #[default]
    Never,
    /// Fixed wall-clock instant after which the entry is invalid
    Absolute(DateTime<Utc>),
    /// Duration re-applied from "now" when the entry is added or refreshed
    Sliding(Duration),
}

impl Expiration {
    /// Absolute expiration `ttl` from now.
    pub fn after(ttl: Duration) -> Self {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .map_or(Expiration::Never, Expiration::Absolute)
    }

    /// Monotonic deadline derived from this policy, None = never expires.
    ///
    /// An absolute instant already in the past maps to `now`. Deadlines too
    /// far out to represent are treated as infinite.
    pub(crate) fn deadline_from(&self, now: Instant) -> Option<Instant> {
        match self {
            Expiration::Never => None,
            Expiration::Absolute(at) => match (*at - Utc::now()).to_std() {
                Ok(remaining) => now.checked_add(remaining),
                Err(_) => Some(now),
            },
            Expiration::Sliding(window) => now.checked_add(*window),
        }
    }

    fn validate(&self) -> Result<()> {
        if let Expiration::Sliding(window) = self {
            if window.is_zero() {
                return Err(CacheError::InvalidArgument(
                    "sliding expiration must be greater than zero".to_string(),
                ));
            }
            if *window > MAX_SLIDING_EXPIRATION {
                return Err(CacheError::InvalidArgument(
                    "sliding expiration must not exceed one year".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Whether an entry may be chosen by capacity-driven trimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Removable,
    /// Excluded from LRU trimming, still subject to expiration
    NotRemovable,
}

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovedReason {
    /// Explicit `remove`
    Removed,
    /// Deadline passed (lazy read, sweep, or trim)
    Expired,
    /// Chosen by trim or `max_entries` enforcement
    Evicted,
    /// A change monitor the entry depends on fired
    DependencyChanged,
}

/// Observer invoked with `(key, value, reason)` once the entry is removed.
pub type RemovedCallback<V> = Arc<dyn Fn(&str, &V, RemovedReason) + Send + Sync>;

/// Observer invoked when an entry expires or its dependency changes.
///
/// Returning an update stores the new value under the same key.
pub type UpdateCallback<V> =
    Arc<dyn Fn(&str, RemovedReason) -> Option<CacheEntryUpdate<V>> + Send + Sync>;

/// Replacement supplied by an update callback.
pub struct CacheEntryUpdate<V> {
    pub value: V,
    pub policy: CachePolicy<V>,
}

// == Cache Policy ==
/// Per-entry options: expiration, priority, dependencies and observers.
pub struct CachePolicy<V> {
    pub expiration: Expiration,
    pub priority: Priority,
    pub change_monitors: Vec<Arc<dyn ChangeMonitor>>,
    pub on_removed: Option<RemovedCallback<V>>,
    pub on_updated: Option<UpdateCallback<V>>,
}

impl<V> CachePolicy<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absolute(at: DateTime<Utc>) -> Self {
        Self::new().with_expiration(Expiration::Absolute(at))
    }

    /// Absolute expiration `ttl` from now.
    pub fn expires_in(ttl: Duration) -> Self {
        Self::new().with_expiration(Expiration::after(ttl))
    }

    pub fn sliding(window: Duration) -> Self {
        Self::new().with_expiration(Expiration::Sliding(window))
    }

    pub fn with_expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_change_monitor(mut self, monitor: Arc<dyn ChangeMonitor>) -> Self {
        self.change_monitors.push(monitor);
        self
    }

    pub fn on_removed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &V, RemovedReason) + Send + Sync + 'static,
    {
        self.on_removed = Some(Arc::new(callback));
        self
    }

    pub fn on_updated<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, RemovedReason) -> Option<CacheEntryUpdate<V>> + Send + Sync + 'static,
    {
        self.on_updated = Some(Arc::new(callback));
        self
    }

    // == Validate ==
    /// Rejects policies the cache cannot honor.
    pub fn validate(&self) -> Result<()> {
        self.expiration.validate()?;
        if self.on_removed.is_some() && self.on_updated.is_some() {
            return Err(CacheError::InvalidArgument(
                "a policy may set either a removed callback or an update callback, not both"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

impl<V> Default for CachePolicy<V> {
    fn default() -> Self {
        Self {
            expiration: Expiration::Never,
            priority: Priority::Removable,
            change_monitors: Vec::new(),
            on_removed: None,
            on_updated: None,
        }
    }
}

impl<V> Clone for CachePolicy<V> {
    fn clone(&self) -> Self {
        Self {
            expiration: self.expiration,
            priority: self.priority,
            change_monitors: self.change_monitors.clone(),
            on_removed: self.on_removed.clone(),
            on_updated: self.on_updated.clone(),
        }
    }
}

impl<V> fmt::Debug for CachePolicy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("expiration", &self.expiration)
            .field("priority", &self.priority)
            .field("change_monitors", &self.change_monitors.len())
            .field("on_removed", &self.on_removed.is_some())
            .field("on_updated", &self.on_updated.is_some())
            .finish()
    }
}

// == Cache Entry ==
struct EntryState<V> {
    value: V,
    expiration: Expiration,
    expires_at: Option<Instant>,
    generation: u64,
    priority: Priority,
    change_monitors: Vec<Arc<dyn ChangeMonitor>>,
    registrations: Vec<(Arc<dyn ChangeMonitor>, Registration)>,
    on_removed: Option<RemovedCallback<V>>,
    on_updated: Option<UpdateCallback<V>>,
    dependents: Vec<Weak<SignaledChangeMonitor>>,
    last_modified: DateTime<Utc>,
}

/// A single key/value record owned by a container.
///
/// The key and identity never change. Everything else sits behind the entry's
/// own lock and is only mutated while the owning container holds its write
/// section. `generation` is bumped on every in-place update so that expiration
/// queue slots and change subscriptions taken earlier can tell they are stale.
pub struct CacheEntry<V> {
    id: EntryId,
    key: String,
    created_at: DateTime<Utc>,
    disabled: AtomicBool,
    state: Mutex<EntryState<V>>,
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    /// Creates a live entry, computing its deadline from the policy.
    pub fn new(key: impl Into<String>, value: V, policy: CachePolicy<V>) -> Result<Self> {
        policy.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: EntryId::next(),
            key: key.into(),
            created_at: now,
            disabled: AtomicBool::new(false),
            state: Mutex::new(EntryState {
                value,
                expiration: policy.expiration,
                expires_at: policy.expiration.deadline_from(Instant::now()),
                generation: 0,
                priority: policy.priority,
                change_monitors: policy.change_monitors,
                registrations: Vec::new(),
                on_removed: policy.on_removed,
                on_updated: policy.on_updated,
                dependents: Vec::new(),
                last_modified: now,
            }),
        })
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.state.lock().last_modified
    }

    pub fn expiration(&self) -> Expiration {
        self.state.lock().expiration
    }

    /// Monotonic deadline, None if the entry never expires.
    pub fn expires_at(&self) -> Option<Instant> {
        self.state.lock().expires_at
    }

    pub fn priority(&self) -> Priority {
        self.state.lock().priority
    }

    pub(crate) fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Deadline and generation read under one lock acquisition.
    pub(crate) fn schedule(&self) -> (Option<Instant>, u64) {
        let state = self.state.lock();
        (state.expires_at, state.generation)
    }

    /// True once the entry has been logically removed.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    // == Is Expired ==
    /// Checks if the entry has a deadline at or before now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        matches!(self.expires_at(), Some(deadline) if deadline <= now)
    }

    /// Replaces the value and stamps `last_modified`.
    pub fn set_value(&self, value: V) {
        let mut state = self.state.lock();
        state.value = value;
        state.last_modified = Utc::now();
    }

    /// Replaces value, expiration, priority, callbacks and dependencies in place.
    ///
    /// The returned `Superseded` carries the dropped subscriptions and must be
    /// fired once the container lock is released, after the new policy's
    /// monitors have been subscribed.
    pub(crate) fn update(&self, value: V, policy: CachePolicy<V>) -> Superseded {
        let mut state = self.state.lock();
        state.value = value;
        state.last_modified = Utc::now();
        state.expiration = policy.expiration;
        state.expires_at = policy.expiration.deadline_from(Instant::now());
        state.generation += 1;
        state.priority = policy.priority;
        state.on_removed = policy.on_removed;
        state.on_updated = policy.on_updated;
        state.change_monitors = policy.change_monitors;
        Superseded {
            registrations: std::mem::take(&mut state.registrations),
            dependents: std::mem::take(&mut state.dependents),
        }
    }

    /// Re-applies a sliding window from now. No-op for other policies.
    pub(crate) fn refresh_sliding(&self) -> bool {
        let mut state = self.state.lock();
        let Expiration::Sliding(window) = state.expiration else {
            return false;
        };
        state.expires_at = Instant::now().checked_add(window);
        state.generation += 1;
        true
    }

    pub(crate) fn add_dependent(&self, monitor: Weak<SignaledChangeMonitor>) {
        self.state.lock().dependents.push(monitor);
    }

    // == Mark Removed ==
    /// Disables the entry and hands back its pending notifications.
    ///
    /// Idempotent: only the first call returns a notice, so callbacks can
    /// never fire twice.
    pub(crate) fn mark_removed(&self, reason: RemovedReason) -> Option<RemovalNotice<V>>
    where
        V: Clone,
    {
        if self.disabled.swap(true, Ordering::AcqRel) {
            return None;
        }
        let mut state = self.state.lock();
        Some(RemovalNotice {
            key: self.key.clone(),
            value: state.value.clone(),
            reason,
            on_removed: state.on_removed.take(),
            on_updated: state.on_updated.take(),
            registrations: std::mem::take(&mut state.registrations),
            dependents: std::mem::take(&mut state.dependents),
        })
    }
}

impl<V: Clone> CacheEntry<V> {
    pub fn value(&self) -> V {
        self.state.lock().value.clone()
    }
}

impl<V: Send + Sync + 'static> CacheEntry<V> {
    // == Mark Added ==
    /// Subscribes to every change monitor of the entry.
    ///
    /// `on_changed` receives the entry and the generation it was subscribed
    /// at. Subscriptions hold only weak references, and fire nothing if the
    /// entry was removed or updated in the meantime. Each registration is kept
    /// on the entry so that removal releases exactly its own callbacks. Must
    /// be called without the container lock held: a monitor that already
    /// changed runs the callback immediately.
    pub(crate) fn mark_added<F>(self: &Arc<Self>, on_changed: F)
    where
        F: Fn(&Arc<CacheEntry<V>>, u64) + Clone + Send + Sync + 'static,
    {
        let (monitors, generation) = {
            let state = self.state.lock();
            (state.change_monitors.clone(), state.generation)
        };
        for monitor in monitors {
            let weak = Arc::downgrade(self);
            let on_changed = on_changed.clone();
            let registration = monitor.notify_on_changed(Box::new(move || {
                if let Some(entry) = weak.upgrade() {
                    if !entry.is_disabled() && entry.generation() == generation {
                        on_changed(&entry, generation);
                    }
                }
            }));
            let Some(registration) = registration else {
                continue;
            };

            let mut state = self.state.lock();
            if self.is_disabled() || state.generation != generation {
                // Removed or updated while subscribing; a newer subscription
                // may share this monitor, so never dispose it from here.
                drop(state);
                monitor.unregister(registration);
            } else {
                state.registrations.push((monitor, registration));
            }
        }
    }
}

impl<V> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("expiration", &state.expiration)
            .field("priority", &state.priority)
            .field("generation", &state.generation)
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

// == Deferred Notifications ==
/// Notifications owed for a removed entry, fired outside the container lock.
pub(crate) struct RemovalNotice<V> {
    key: String,
    value: V,
    reason: RemovedReason,
    on_removed: Option<RemovedCallback<V>>,
    on_updated: Option<UpdateCallback<V>>,
    registrations: Vec<(Arc<dyn ChangeMonitor>, Registration)>,
    dependents: Vec<Weak<SignaledChangeMonitor>>,
}

impl<V> RemovalNotice<V> {
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Signals dependents, releases monitors and runs the observer.
    ///
    /// Returns the replacement supplied by an update callback, if any.
    pub(crate) fn fire(mut self) -> Option<CacheEntryUpdate<V>> {
        signal_dependents(&self.dependents);
        release(std::mem::take(&mut self.registrations));

        let updatable = matches!(
            self.reason,
            RemovedReason::Expired | RemovedReason::DependencyChanged
        );
        if let (true, Some(on_updated)) = (updatable, &self.on_updated) {
            return invoke_guarded("update", &self.key, || on_updated(&self.key, self.reason))
                .flatten();
        }
        if let Some(on_removed) = &self.on_removed {
            invoke_guarded("removed", &self.key, || {
                on_removed(&self.key, &self.value, self.reason)
            });
        }
        None
    }
}

/// Subscriptions dropped by an in-place update.
pub(crate) struct Superseded {
    registrations: Vec<(Arc<dyn ChangeMonitor>, Registration)>,
    dependents: Vec<Weak<SignaledChangeMonitor>>,
}

impl Superseded {
    pub(crate) fn fire(self) {
        signal_dependents(&self.dependents);
        release(self.registrations);
    }
}

fn signal_dependents(dependents: &[Weak<SignaledChangeMonitor>]) {
    for dependent in dependents.iter().filter_map(Weak::upgrade) {
        dependent.signal();
    }
}
