//! In-flight work tracker.
//!
//! Detached tasks (alarm dispatches) register themselves here so shutdown
//! can drain them: every `use_one` is paired with exactly one release via
//! the returned guard, and `wait` blocks until the count reaches zero.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

pub struct InFlight {
    count: AtomicUsize,
    notify: Notify,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        })
    }

    /// Register one unit of outstanding work. The returned guard releases
    /// it on drop, so a panicking task still releases.
    pub fn use_one(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    /// Number of outstanding units.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Block until all outstanding work has been released.
    pub async fn wait(&self) {
        loop {
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before the re-check, so a release between
            // the check and the await cannot be missed.
            notified.as_mut().enable();

            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }

            notified.await;
        }
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// RAII release handle for one unit of in-flight work.
pub struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.done();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let tracker = InFlight::new();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let tracker = InFlight::new();
        let guard = tracker.use_one();
        assert_eq!(tracker.count(), 1);

        drop(guard);
        assert_eq!(tracker.count(), 0);
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_wait_blocks_until_all_released() {
        let tracker = InFlight::new();
        let first = tracker.use_one();
        let second = tracker.use_one();

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                tracker.wait().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait completed")
            .expect("waiter task");
    }

    #[tokio::test]
    async fn test_guard_released_from_detached_task() {
        let tracker = InFlight::new();
        let guard = tracker.use_one();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });

        tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .expect("wait completed");
    }
}
