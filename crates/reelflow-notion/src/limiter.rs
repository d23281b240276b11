use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Rolling-window rate limiter: at most `capacity` operations per `window`.
/// One instance is shared process-wide so the sync push loop and webhook
/// processing draw from the same budget.
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    recent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// The planning database's posted limit: 3 operations per second.
    pub fn planning_default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }

    /// Wait until an operation slot is free, then take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut recent = self.recent.lock().await;
                let now = Instant::now();
                while let Some(front) = recent.front() {
                    if now.duration_since(*front) >= self.window {
                        recent.pop_front();
                    } else {
                        break;
                    }
                }
                if recent.len() < self.capacity {
                    recent.push_back(now);
                    return;
                }
                // Oldest in-window entry decides when a slot opens.
                self.window - now.duration_since(*recent.front().expect("non-empty"))
            };
            tokio::time::sleep(wait).await;
        }
    }
}
