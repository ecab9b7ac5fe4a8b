//! Cache Module
//!
//! Provides the in-process cache engine: entries with absolute or sliding
//! expiration, an expiration queue, a recency index and the container that
//! coordinates them.

mod container;
mod entry;
mod expiration;
mod lru;
mod monitor;
mod stats;

#[cfg(test)]
mod property_tests;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

// Re-export public types
pub use container::{CacheContainer, ContainerSettings};
pub(crate) use container::check_trim_percent;
pub use entry::{
    CacheEntry, CacheEntryUpdate, CachePolicy, EntryId, Expiration, Priority, RemovedCallback,
    RemovedReason, UpdateCallback,
};
pub use expiration::ExpirationQueue;
pub use lru::{RecencyIndex, MIN_TRIM_OCCUPANCY};
pub use monitor::{
    ChangeCallback, ChangeMonitor, EntryChangeMonitor, Registration, SignaledChangeMonitor,
};
pub use stats::{CacheCounters, CacheStats};

// == Public Constants ==
/// Longest sliding expiration an entry may carry.
pub const MAX_SLIDING_EXPIRATION: std::time::Duration =
    std::time::Duration::from_secs(365 * 24 * 60 * 60);

// == Observer Isolation ==
/// Runs an observer callback, absorbing any panic it raises.
///
/// Returns None when the callback panicked.
pub(crate) fn invoke_guarded<R>(what: &str, key: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(_) => {
            warn!("{} callback for key '{}' panicked; ignoring", what, key);
            None
        }
    }
}

/// Looks up several keys through `lookup`; keys it misses are left out.
pub(crate) fn collect_values<'a, V, I>(
    keys: I,
    lookup: impl Fn(&str) -> Option<V>,
) -> HashMap<String, V>
where
    I: IntoIterator<Item = &'a str>,
{
    keys.into_iter()
        .filter_map(|key| lookup(key).map(|value| (key.to_string(), value)))
        .collect()
}
