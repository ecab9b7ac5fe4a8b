//! Expiration Sweep Task
//!
//! Per-container recurring timer that drains expired entries. The timer is
//! only armed while the container holds at least one expirable entry; arming
//! and disarming happen under the container's write section so two threads
//! can never both decide to start one.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

/// Owner of a container's sweep task.
#[derive(Debug, Default)]
pub(crate) struct SweepTimer {
    handle: Option<JoinHandle<()>>,
    warned_no_runtime: bool,
}

impl SweepTimer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    // == Arm ==
    /// Starts the sweep task unless one is already running.
    ///
    /// `tick` runs once per interval and returns false when the owning
    /// container is gone, which ends the task. Without a tokio runtime the
    /// timer stays disarmed and expiry is left to reads and trims.
    pub(crate) fn arm<F>(&mut self, runtime: Option<&Handle>, interval: Duration, label: &str, mut tick: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        if self.is_armed() {
            return;
        }
        let Some(runtime) = runtime else {
            if !self.warned_no_runtime {
                debug!(
                    "No tokio runtime for cache '{}'; expired entries are removed lazily",
                    label
                );
                self.warned_no_runtime = true;
            }
            return;
        };

        debug!("Arming sweep timer for cache '{}' every {:?}", label, interval);
        self.handle = Some(runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !tick() {
                    break;
                }
            }
        }));
    }

    // == Disarm ==
    /// Cancels the sweep task if one is running.
    ///
    /// Safe to call from inside the task itself: it is cancelled at its next
    /// sleep.
    pub(crate) fn disarm(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("Sweep timer disarmed");
        }
    }
}

impl Drop for SweepTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_timer_ticks_until_disarmed() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut timer = SweepTimer::new();

        timer.arm(
            Some(&Handle::current()),
            Duration::from_millis(10),
            "test",
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            },
        );
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_millis(100)).await;
        timer.disarm();
        assert!(!timer.is_armed());

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {}", seen);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_arm_is_idempotent() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut timer = SweepTimer::new();
        for _ in 0..3 {
            let counter = ticks.clone();
            timer.arm(
                Some(&Handle::current()),
                Duration::from_millis(20),
                "test",
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                },
            );
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        timer.disarm();
        assert!(ticks.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_task_ends_when_tick_returns_false() {
        let mut timer = SweepTimer::new();
        timer.arm(Some(&Handle::current()), Duration::from_millis(5), "test", || false);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_arm_without_runtime_stays_disarmed() {
        let mut timer = SweepTimer::new();
        timer.arm(None, Duration::from_millis(5), "test", || true);
        assert!(!timer.is_armed());
    }
}
