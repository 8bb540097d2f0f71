//! Per-task-kind rate limiting for the queue worker.
//!
//! Each kind gets its own GCRA bucket from `governor`: bursts of up to
//! `max_ops`, refilled at one slot every `window / max_ops`. On top of that a
//! kind can be blocked for a full window after an upstream quota error.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};

pub struct RateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    clock: DefaultClock,
    window: Duration,
    blocked_until: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(max_ops: usize, window: Duration) -> Self {
        let burst = NonZeroU32::new(u32::try_from(max_ops).unwrap_or(u32::MAX))
            .unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(window / burst.get())
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);
        Self {
            limiter: governor::RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
            window,
            blocked_until: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Take one slot for `kind`, or return how long until one frees up.
    pub fn try_acquire(&self, kind: &str) -> Result<(), Duration> {
        self.try_acquire_at(kind, Instant::now())
    }

    /// `now` only drives the back-off check; the bucket runs on governor's clock.
    pub(crate) fn try_acquire_at(&self, kind: &str, now: Instant) -> Result<(), Duration> {
        {
            let mut blocked = self
                .blocked_until
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(&until) = blocked.get(kind) {
                if now < until {
                    return Err(until - now);
                }
                blocked.remove(kind);
            }
        }

        self.limiter
            .check_key(&kind.to_string())
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Block `kind` for one window.
    pub fn back_off(&self, kind: &str) {
        self.back_off_at(kind, Instant::now());
    }

    pub(crate) fn back_off_at(&self, kind: &str, now: Instant) {
        self.blocked_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(kind.to_string(), now + self.window);
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}
