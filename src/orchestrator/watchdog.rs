use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Deadline {
    last_reset: Instant,
    wait: Duration,
}

impl Deadline {
    fn at(&self) -> Instant {
        self.last_reset + self.wait
    }
}

/// Idle timer of the container
///
/// Expires once `wait` has passed since the last [`Watchdog::reset`]. Changing
/// the duration restarts a pending wait measured from the last reset.
pub struct Watchdog {
    deadline: Mutex<Deadline>,
    changed: Notify,
}

impl Watchdog {
    pub fn new(wait: Duration) -> Self {
        Self {
            deadline: Mutex::new(Deadline {
                last_reset: Instant::now(),
                wait,
            }),
            changed: Notify::new(),
        }
    }

    pub fn reset(&self) {
        self.deadline.lock().last_reset = Instant::now();
    }

    pub fn duration(&self) -> Duration {
        self.deadline.lock().wait
    }

    pub fn set_duration(&self, wait: Duration) {
        self.deadline.lock().wait = wait;
        self.changed.notify_waiters();
    }

    pub fn deadline(&self) -> Instant {
        self.deadline.lock().at()
    }

    /// Wait for expiry; returns `false` if `cancel` fired first
    pub async fn expired(&self, cancel: &CancellationToken) -> bool {
        loop {
            let changed = self.changed.notified();
            let deadline = self.deadline();

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = changed => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    // a reset may have moved the deadline while we slept
                    if Instant::now() >= self.deadline() {
                        return true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_expires() {
        let watchdog = Watchdog::new(Duration::from_millis(50));
        let started = Instant::now();
        assert!(watchdog.expired(&CancellationToken::new()).await);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_cancel_stops_wait() {
        let watchdog = Watchdog::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!watchdog.expired(&cancel).await);
    }

    #[tokio::test]
    async fn test_reset_postpones_expiry() {
        let watchdog = Arc::new(Watchdog::new(Duration::from_millis(200)));
        let waiter = {
            let watchdog = Arc::clone(&watchdog);
            tokio::spawn(async move { watchdog.expired(&CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(120)).await;
        watchdog.reset();
        let reset_at = Instant::now();

        assert!(waiter.await.unwrap());
        assert!(reset_at.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_shorter_duration_interrupts_wait() {
        let watchdog = Arc::new(Watchdog::new(Duration::from_secs(60)));
        let started = Instant::now();
        let waiter = {
            let watchdog = Arc::clone(&watchdog);
            tokio::spawn(async move { watchdog.expired(&CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        watchdog.set_duration(Duration::from_millis(100));

        assert!(waiter.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(watchdog.duration(), Duration::from_millis(100));
    }
}
