//! Change Monitor Module
//!
//! External invalidation sources an entry can depend on. The cache only
//! consumes the narrow `ChangeMonitor` contract; how a source detects change
//! is its own business.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::invoke_guarded;

/// Callback handed to a change monitor; invoked at most once.
pub type ChangeCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to one pending callback on a change monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Registration(u64);

impl Registration {
    pub fn new(id: u64) -> Self {
        Registration(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

// == Change Monitor Contract ==
/// An external dependency whose invalidation forces early entry removal.
pub trait ChangeMonitor: Send + Sync {
    /// Returns true once the monitored source has changed.
    fn has_changed(&self) -> bool;

    /// Registers a callback fired once when the source changes.
    ///
    /// If the source has already changed the callback runs immediately on the
    /// calling thread and no registration is returned. A disposed monitor
    /// drops the callback and also returns None.
    fn notify_on_changed(&self, callback: ChangeCallback) -> Option<Registration>;

    /// Drops one pending callback and returns how many are still waiting.
    ///
    /// Unknown or already fired registrations are ignored.
    fn unregister(&self, registration: Registration) -> usize;

    /// Releases the monitor. Pending callbacks are dropped without running.
    fn dispose(&self);
}

/// Gives up registrations held by a departing entry.
///
/// A monitor is disposed only once nobody else is waiting on it.
pub(crate) fn release(registrations: Vec<(Arc<dyn ChangeMonitor>, Registration)>) {
    for (monitor, registration) in registrations {
        if monitor.unregister(registration) == 0 {
            monitor.dispose();
        }
    }
}

// == Signaled Change Monitor ==
#[derive(Default)]
struct SignalState {
    changed: bool,
    disposed: bool,
    next_registration: u64,
    callbacks: Vec<(Registration, ChangeCallback)>,
}

/// A change monitor that is flipped by an explicit `signal()` call.
///
/// Several entries may share one monitor; each registration fires once.
#[derive(Default)]
pub struct SignaledChangeMonitor {
    state: Mutex<SignalState>,
}

impl SignaledChangeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    // == Signal ==
    /// Marks the source as changed and fires every registered callback.
    ///
    /// Callbacks run after the monitor's own lock is released. Signalling an
    /// already changed or disposed monitor does nothing.
    pub fn signal(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.changed || state.disposed {
                return;
            }
            state.changed = true;
            std::mem::take(&mut state.callbacks)
        };
        for (_, callback) in callbacks {
            invoke_guarded("change monitor", "", callback);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Number of callbacks waiting for a change.
    pub fn pending_callbacks(&self) -> usize {
        self.state.lock().callbacks.len()
    }
}

impl ChangeMonitor for SignaledChangeMonitor {
    fn has_changed(&self) -> bool {
        self.state.lock().changed
    }

    fn notify_on_changed(&self, callback: ChangeCallback) -> Option<Registration> {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return None;
            }
            if !state.changed {
                state.next_registration += 1;
                let registration = Registration(state.next_registration);
                state.callbacks.push((registration, callback));
                return Some(registration);
            }
        }
        invoke_guarded("change monitor", "", callback);
        None
    }

    fn unregister(&self, registration: Registration) -> usize {
        let mut state = self.state.lock();
        state.callbacks.retain(|(id, _)| *id != registration);
        state.callbacks.len()
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        state.callbacks.clear();
    }
}

impl fmt::Debug for SignaledChangeMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SignaledChangeMonitor")
            .field("changed", &state.changed)
            .field("disposed", &state.disposed)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

// == Entry Change Monitor ==
/// Changes when any of a set of cache entries is removed or replaced.
///
/// Created through `MemoryCache::create_entry_change_monitor`. If one of the
/// watched keys is absent at creation the monitor starts out changed.
#[derive(Debug)]
pub struct EntryChangeMonitor {
    keys: Vec<String>,
    signal: Arc<SignaledChangeMonitor>,
}

impl EntryChangeMonitor {
    pub(crate) fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            signal: Arc::new(SignaledChangeMonitor::new()),
        }
    }

    /// Keys this monitor watches.
    pub fn cache_keys(&self) -> &[String] {
        &self.keys
    }

    pub(crate) fn signal_handle(&self) -> &Arc<SignaledChangeMonitor> {
        &self.signal
    }
}

impl ChangeMonitor for EntryChangeMonitor {
    fn has_changed(&self) -> bool {
        self.signal.has_changed()
    }

    fn notify_on_changed(&self, callback: ChangeCallback) -> Option<Registration> {
        self.signal.notify_on_changed(callback)
    }

    fn unregister(&self, registration: Registration) -> usize {
        self.signal.unregister(registration)
    }

    fn dispose(&self) {
        self.signal.dispose();
    }
}
