use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

/// Global post throttle: at most one successful post per `interval`.
///
/// The permit holds the lock for the whole post, so two processors sharing a
/// throttle cannot both pass the same window.
#[derive(Debug)]
pub struct PostThrottle {
    interval: Duration,
    last_success: Mutex<Option<Instant>>,
}

impl PostThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_success: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn acquire(&self) -> ThrottlePermit<'_> {
        let guard = self.last_success.lock().await;
        if let Some(last) = *guard {
            let ready_at = last + self.interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        ThrottlePermit { guard }
    }
}

pub struct ThrottlePermit<'a> {
    guard: MutexGuard<'a, Option<Instant>>,
}

impl ThrottlePermit<'_> {
    /// Starts the next window. Dropping the permit without calling this leaves
    /// the window where it was: failed posts do not delay the next attempt.
    pub fn record_success(mut self) {
        *self.guard = Some(Instant::now());
    }
}
