//! Token-bucket rate limiter with cooperative-blocking `acquire`.
//!
//! Unlike a non-blocking gate that immediately denies an over-budget caller,
//! `acquire(n)` suspends the caller until `n` tokens are available or
//! cancellation fires. Tokens refill purely from elapsed wall-clock time
//! against a [`Clock`] — there is no background ticker task. Waiters are
//! served in FIFO order: only the head of the wait queue is allowed to take
//! tokens, so a later arrival can never jump ahead of an earlier one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, MonotonicClock};

/// Returned by `acquire` when cancellation fires before enough tokens free up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rate limiter acquire cancelled")
    }
}
impl std::error::Error for Cancelled {}

struct Bucket {
    tokens: f64,
    last_refill_millis: u64,
}

struct Waiter {
    notify: Arc<Notify>,
}

struct Inner {
    bucket: Mutex<Bucket>,
    waiters: Mutex<VecDeque<Waiter>>,
    rate_per_sec: f64,
    burst: f64,
    clock: Arc<dyn Clock>,
}

/// Token-bucket rate limiter. Cheap to clone; clones share one bucket.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// `rate_per_sec` tokens accrue per second, capped at `burst` tokens held.
    /// The bucket starts full.
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self::with_clock(rate_per_sec, burst, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(rate_per_sec: f64, burst: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                bucket: Mutex::new(Bucket { tokens: burst, last_refill_millis: clock.now_millis() }),
                waiters: Mutex::new(VecDeque::new()),
                rate_per_sec,
                burst,
                clock,
            }),
        }
    }

    fn refill_locked(&self, bucket: &mut Bucket) {
        let now = self.inner.clock.now_millis();
        let elapsed_millis = now.saturating_sub(bucket.last_refill_millis);
        if elapsed_millis == 0 {
            return;
        }
        let added = (elapsed_millis as f64 / 1000.0) * self.inner.rate_per_sec;
        bucket.tokens = (bucket.tokens + added).min(self.inner.burst);
        bucket.last_refill_millis = now;
    }

    fn try_take(&self, permits: u32) -> bool {
        let mut bucket = self.inner.bucket.lock().unwrap();
        self.refill_locked(&mut bucket);
        if bucket.tokens >= permits as f64 {
            bucket.tokens -= permits as f64;
            true
        } else {
            false
        }
    }

    /// Block until `permits` tokens are available or `cancellation` fires.
    /// Waiters are served FIFO: a caller only attempts to take tokens once it
    /// is at the head of the wait queue.
    pub async fn acquire(
        &self,
        permits: u32,
        cancellation: &CancellationToken,
    ) -> Result<(), Cancelled> {
        let notify = Arc::new(Notify::new());
        {
            let mut waiters = self.inner.waiters.lock().unwrap();
            waiters.push_back(Waiter { notify: notify.clone() });
        }

        loop {
            if cancellation.is_cancelled() {
                self.remove_waiter(&notify);
                self.wake_next();
                return Err(Cancelled);
            }

            let is_head = {
                let waiters = self.inner.waiters.lock().unwrap();
                waiters.front().map(|w| Arc::ptr_eq(&w.notify, &notify)).unwrap_or(false)
            };

            if is_head && self.try_take(permits) {
                let mut waiters = self.inner.waiters.lock().unwrap();
                waiters.pop_front();
                drop(waiters);
                self.wake_next();
                return Ok(());
            }

            let wait = notify.notified();
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    self.remove_waiter(&notify);
                    self.wake_next();
                    return Err(Cancelled);
                }
                _ = wait => {}
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
    }

    fn remove_waiter(&self, notify: &Arc<Notify>) {
        let mut waiters = self.inner.waiters.lock().unwrap();
        waiters.retain(|w| !Arc::ptr_eq(&w.notify, notify));
    }

    /// Wake the new head so it re-checks eligibility; harmless no-op if empty.
    fn wake_next(&self) {
        let waiters = self.inner.waiters.lock().unwrap();
        if let Some(front) = waiters.front() {
            front.notify.notify_one();
        }
    }

    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.inner.bucket.lock().unwrap();
        self.refill_locked(&mut bucket);
        bucket.tokens
    }
}
