//! Background Tasks Module
//!
//! Contains background tasks that run periodically while a cache is alive.
//!
//! # Tasks
//! - Expiration sweep: removes expired entries at the configured polling interval

mod sweep;

pub(crate) use sweep::SweepTimer;
