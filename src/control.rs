// Control plane: admission control for route setup
//
// Bounds how many DialRouteGroup requests a setup node works on at once and
// how many it starts per second.
//
// Numan Thabit 2025 Nov

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub const DEFAULT_RATE_PER_SEC: u32 = 200;

#[derive(Clone)]
pub struct AdmissionControl {
    max_inflight: Arc<Semaphore>,
    // Allow up to rate_per_sec admissions within a 1s sliding window
    limiter: Arc<Mutex<RateLimiter>>,
}

struct RateLimiter {
    rate_per_sec: u32,
    timestamps: VecDeque<Instant>,
    window: Duration,
}

impl RateLimiter {
    /// Record an admission at `now` if the window has room; otherwise how long to wait.
    fn try_admit(&mut self, now: Instant) -> Result<(), Duration> {
        while let Some(front) = self.timestamps.front() {
            if now.duration_since(*front) > self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        if (self.timestamps.len() as u32) < self.rate_per_sec {
            self.timestamps.push_back(now);
            return Ok(());
        }
        let oldest = self.timestamps.front().copied().unwrap_or(now);
        Err(self
            .window
            .saturating_sub(now.duration_since(oldest))
            .max(Duration::from_millis(1)))
    }
}

impl AdmissionControl {
    pub fn new(max_inflight: usize, rate_per_sec: Option<u32>) -> Self {
        let limiter = RateLimiter {
            rate_per_sec: rate_per_sec.unwrap_or(DEFAULT_RATE_PER_SEC).max(1),
            timestamps: VecDeque::with_capacity(256),
            window: Duration::from_secs(1),
        };
        Self {
            max_inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
            limiter: Arc::new(Mutex::new(limiter)),
        }
    }

    /// Wait for a slot. `None` once the semaphore has been closed.
    pub async fn acquire(&self) -> Option<AdmissionPermit> {
        loop {
            let wait = match self.limiter.lock().await.try_admit(Instant::now()) {
                Ok(()) => break,
                Err(wait) => wait,
            };
            debug!(wait_ms = wait.as_millis() as u64, "setup rate limit reached");
            tokio::time::sleep(wait).await;
        }
        let permit = self.max_inflight.clone().acquire_owned().await.ok()?;
        Some(AdmissionPermit { _permit: permit })
    }

    pub fn available(&self) -> usize {
        self.max_inflight.available_permits()
    }

    /// Refuse further admissions; waiters get `None`.
    pub fn close(&self) {
        self.max_inflight.close();
    }
}

pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}
