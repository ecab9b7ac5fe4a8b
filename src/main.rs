//! Memory Cache soak driver
//!
//! Exercises a sharded cache with concurrent workers mixing writes, reads,
//! removals and trims, and logs aggregated statistics until interrupted.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use memory_cache::{CacheConfig, CachePolicy, MemoryCache, Priority, RemovedReason};

/// Soak parameters read from the environment.
///
/// # Environment Variables
/// - `SOAK_WORKERS` - number of concurrent workers (default: 8)
/// - `SOAK_KEY_SPACE` - number of distinct keys (default: 10000)
/// - `SOAK_STATS_INTERVAL` - seconds between stats lines (default: 5)
#[derive(Debug, Clone, Copy)]
struct SoakSettings {
    workers: usize,
    key_space: usize,
    stats_interval: Duration,
}

impl SoakSettings {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            workers: read_var("SOAK_WORKERS", 8)?,
            key_space: read_var("SOAK_KEY_SPACE", 10_000)?.max(1),
            stats_interval: Duration::from_secs(read_var("SOAK_STATS_INTERVAL", 5)?.max(1) as u64),
        })
    }
}

fn read_var(name: &str, default: usize) -> anyhow::Result<usize> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a non-negative integer, got '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

/// Main entry point for the soak driver.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load cache and soak configuration from environment variables
/// 3. Spawn workers and the stats reporter
/// 4. Stop everything on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "memory_cache=info,memory_cache_soak=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CacheConfig::from_env("soak").context("invalid cache configuration")?;
    let settings = SoakSettings::from_env()?;
    info!(
        "Configuration loaded: shards={}, max_entries={:?}, polling_interval={:?}, workers={}, key_space={}",
        config.shard_count,
        config.max_entries,
        config.polling_interval,
        settings.workers,
        settings.key_space
    );

    let cache: Arc<MemoryCache<String>> = Arc::new(MemoryCache::new(config)?);
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut tasks: Vec<JoinHandle<()>> = (0..settings.workers)
        .map(|worker| {
            tokio::spawn(run_worker(
                worker,
                cache.clone(),
                settings.key_space,
                stop_rx.clone(),
            ))
        })
        .collect();
    tasks.push(tokio::spawn(report_stats(
        cache.clone(),
        settings.stats_interval,
        stop_rx,
    )));
    info!("Soak running with {} workers", settings.workers);

    shutdown_signal().await;
    stop_tx.send(true).context("all soak tasks exited early")?;
    for task in tasks {
        if let Err(err) = task.await {
            warn!("Soak task failed: {}", err);
        }
    }

    let stats = cache.stats();
    info!("Final stats: {}", serde_json::to_string(&stats)?);
    info!("Soak shutdown complete");
    Ok(())
}

async fn run_worker(
    worker: usize,
    cache: Arc<MemoryCache<String>>,
    key_space: usize,
    mut stop: watch::Receiver<bool>,
) {
    let mut step: usize = worker;
    loop {
        for _ in 0..64 {
            step = step.wrapping_mul(31).wrapping_add(7919);
            let key = format!("key{}", step % key_space);
            match step % 10 {
                0..=3 => {
                    let _ = cache.get(&key);
                }
                4..=6 => {
                    if let Err(err) = cache.set(key, format!("w{}-{}", worker, step), policy_for(step)) {
                        warn!("Worker {} set failed: {}", worker, err);
                    }
                }
                7 => {
                    let _ = cache.add_or_get_existing(key, "first".to_string(), CachePolicy::new());
                }
                8 => {
                    cache.remove(&key);
                }
                _ => {
                    if step % 1000 == 9 {
                        match cache.trim(10) {
                            Ok(removed) => debug!("Worker {} trimmed {} entries", worker, removed),
                            Err(err) => warn!("Worker {} trim failed: {}", worker, err),
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(Duration::from_millis(1)) => {}
        }
    }
    debug!("Worker {} stopped", worker);
}

fn policy_for(step: usize) -> CachePolicy<String> {
    match step % 4 {
        0 => CachePolicy::expires_in(Duration::from_secs(2)),
        1 => CachePolicy::sliding(Duration::from_secs(5)),
        2 => CachePolicy::new().with_priority(Priority::NotRemovable),
        _ => CachePolicy::new().on_removed(|key: &str, _: &String, reason| {
            if reason == RemovedReason::DependencyChanged {
                debug!("Entry '{}' invalidated", key);
            }
        }),
    }
}

async fn report_stats(
    cache: Arc<MemoryCache<String>>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(interval) => {
                match serde_json::to_string(&cache.stats()) {
                    Ok(json) => info!("Stats: {}", json),
                    Err(err) => warn!("Failed to serialize stats: {}", err),
                }
            }
        }
    }
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
