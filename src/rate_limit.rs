//! Sliding-window admission control for inbound requests.
//!
//! Two independent limiters are consulted for every request: one keyed by
//! the `X-Device-ID` header (when present and sane) and one keyed by the
//! client address. A request is admitted only when neither window is full,
//! and a denied request consumes no quota in either bucket.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

pub const DEVICE_LIMIT: u32 = 60;
pub const ADDRESS_LIMIT: u32 = 300;
pub const WINDOW: Duration = Duration::from_secs(60);
pub const RETRY_AFTER_SECS: u64 = 60;
pub const MAX_DEVICE_ID_LEN: usize = 64;

const MAX_BUCKETS: usize = 50_000;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Time source, injectable so window behavior is testable without waiting.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Admission refusal, carrying the threshold that was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denied {
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BucketKey {
    Device(String),
    Address(String),
}

pub struct RateLimiter {
    clock: Box<dyn Clock>,
    buckets: DashMap<BucketKey, VecDeque<Instant>>,
    started: Instant,
    last_cleanup_secs: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Box::new(SystemClock))
    }

    pub fn with_clock(clock: Box<dyn Clock>) -> Self {
        let started = clock.now();
        RateLimiter {
            clock,
            buckets: DashMap::new(),
            started,
            last_cleanup_secs: AtomicU64::new(0),
        }
    }

    /// Evaluates both limiters for one request. The device limiter only
    /// applies when a usable device id is present; the address limiter
    /// always applies, whatever device ids the callers rotate through.
    pub fn check(&self, device_id: Option<&str>, address: &str) -> Result<(), Denied> {
        let now = self.clock.now();
        self.maybe_cleanup(now);

        let device_key = device_id
            .filter(|id| !id.is_empty() && id.len() <= MAX_DEVICE_ID_LEN)
            .map(|id| BucketKey::Device(id.to_string()));

        if let Some(key) = &device_key {
            self.admit(key.clone(), now, DEVICE_LIMIT)?;
        }

        let address_key = BucketKey::Address(address.to_string());
        if let Err(denied) = self.admit(address_key, now, ADDRESS_LIMIT) {
            // Denial must consume no quota; give back the device slot
            // taken above.
            if let Some(key) = &device_key {
                if let Some(mut entry) = self.buckets.get_mut(key) {
                    entry.pop_back();
                }
            }
            return Err(denied);
        }
        Ok(())
    }

    /// Prunes, counts and records under one bucket lock, so racing checks
    /// on the same key cannot both take the last slot.
    fn admit(&self, key: BucketKey, now: Instant, limit: u32) -> Result<(), Denied> {
        let mut entry = self.buckets.entry(key).or_default();
        prune(entry.value_mut(), now);
        if (entry.len() as u32) >= limit {
            return Err(Denied { limit });
        }
        entry.push_back(now);
        Ok(())
    }

    /// Drops buckets whose newest entry left the window. Runs every five
    /// minutes, or immediately whenever the bucket count passes the cap.
    fn maybe_cleanup(&self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.started).as_secs();
        let last = self.last_cleanup_secs.load(Ordering::Relaxed);
        let over_cap = self.buckets.len() > MAX_BUCKETS;
        if elapsed.saturating_sub(last) < CLEANUP_INTERVAL.as_secs() && !over_cap {
            return;
        }
        if self
            .last_cleanup_secs
            .compare_exchange(last, elapsed, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        self.buckets.retain(|_, times| {
            times
                .back()
                .is_some_and(|t| now.saturating_duration_since(*t) < WINDOW)
        });
        debug!(buckets = self.buckets.len(), "Rate limiter buckets pruned");
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(times: &mut VecDeque<Instant>, now: Instant) {
    while let Some(front) = times.front() {
        if now.saturating_duration_since(*front) >= WINDOW {
            times.pop_front();
        } else {
            break;
        }
    }
}
