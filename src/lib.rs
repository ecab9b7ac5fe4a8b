//! Memory Cache - An in-process object cache
//!
//! Provides key-addressed caching with absolute and sliding expiration,
//! LRU/TTL trimming and change-monitor driven invalidation.

pub mod cache;
pub mod config;
pub mod error;
pub mod facade;
mod tasks;

pub use cache::{
    CacheEntryUpdate, CachePolicy, CacheStats, ChangeMonitor, EntryChangeMonitor, Expiration,
    Priority, Registration, RemovedReason, SignaledChangeMonitor,
};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use facade::MemoryCache;
