//! Quota-aware rate limiter for Gmail API
//!
//! Gmail meters each user in "quota units" per second (250 by default).
//! `messages.list` and `messages.get` cost 5 units, `messages.batchModify`
//! costs 50. Every batch dispatched by the executor draws from one shared
//! token bucket so concurrent batches cannot exceed the per-user quota.
//! A 429 with `Retry-After` holds the whole bucket, not only the batch that
//! saw it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Gmail API quota costs for the calls the task engine makes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCost {
    /// messages.list, users.getProfile
    List,
    /// One messages.get
    Get,
    /// messages.batchModify
    Modify,
    Custom(u32),
}

impl QuotaCost {
    pub fn units(&self) -> u32 {
        match self {
            QuotaCost::List | QuotaCost::Get => 5,
            QuotaCost::Modify => 50,
            QuotaCost::Custom(units) => *units,
        }
    }

    /// Cost of fetching metadata for `count` messages
    pub fn gets(count: usize) -> Self {
        QuotaCost::Custom(QuotaCost::Get.units().saturating_mul(count as u32))
    }
}

/// Token bucket shared by every clone
#[derive(Debug, Clone)]
pub struct QuotaRateLimiter {
    bucket: Arc<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    units: f64,
    capacity: f64,
    units_per_second: f64,
    refilled_at: Instant,
    held_until: Option<Instant>,
    consumed: u64,
    grants: u64,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.units = (self.units + elapsed * self.units_per_second).min(self.capacity);
        self.refilled_at = now;
    }

    /// Take `cost` units, or report how long to wait before trying again
    fn try_take(&mut self, cost: QuotaCost) -> Option<Duration> {
        let now = Instant::now();
        if let Some(until) = self.held_until {
            if until > now {
                return Some(until - now);
            }
            self.held_until = None;
        }
        self.refill(now);

        let wanted = f64::from(cost.units()).min(self.capacity);
        trace!(
            "Quota: {:.1}/{:.1} units available, requesting {:.0}",
            self.units,
            self.capacity,
            wanted
        );
        if self.units >= wanted {
            self.units -= wanted;
            self.consumed += wanted as u64;
            self.grants += 1;
            return None;
        }
        Some(Duration::from_secs_f64((wanted - self.units) / self.units_per_second))
    }
}

impl QuotaRateLimiter {
    /// Gmail's default per-user quota with two seconds of burst
    pub fn new() -> Self {
        Self::per_second(250)
    }

    pub fn per_second(units_per_second: u32) -> Self {
        let rate = f64::from(units_per_second.max(1));
        Self::with_config(rate, rate * 2.0)
    }

    pub fn with_config(units_per_second: f64, capacity: f64) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                units: capacity,
                capacity,
                units_per_second,
                refilled_at: Instant::now(),
                held_until: None,
                consumed: 0,
                grants: 0,
            })),
        }
    }

    /// Wait until `cost` units are available, then consume them.
    ///
    /// A request larger than the bucket is capped at the bucket size so it
    /// can still proceed once the bucket is full.
    pub async fn acquire(&self, cost: QuotaCost) {
        loop {
            let wait = match self.bucket.lock().await.try_take(cost) {
                None => return,
                Some(wait) => wait,
            };
            debug!("Quota exhausted, waiting {:.2}s", wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }
    }

    /// Hold every caller for `delay`, after the server asked us to back off.
    /// An earlier hold that ends later is kept.
    pub async fn hold_off(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut bucket = self.bucket.lock().await;
        if bucket.held_until.map_or(true, |current| current < until) {
            debug!("Holding quota for {:?} after a rate limit response", delay);
            bucket.held_until = Some(until);
        }
    }

    pub async fn stats(&self) -> QuotaStats {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now());
        QuotaStats {
            available_units: bucket.units as u32,
            capacity: bucket.capacity as u32,
            consumed: bucket.consumed,
            grants: bucket.grants,
        }
    }
}

impl Default for QuotaRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaStats {
    pub available_units: u32,
    pub capacity: u32,
    /// Units handed out since creation
    pub consumed: u64,
    /// Successful `acquire` calls
    pub grants: u64,
}
