//! Outbound fetch rate limiting.
//!
//! A token bucket per host plus one global in-flight semaphore. An acquire
//! takes from both: host tokens first (waiters on the same host queue up
//! FIFO on the bucket's fair mutex), then a global permit. The returned
//! lease releases everything on drop.
//!
//! Buckets are created on first use and evicted by the maintenance sweep
//! once they have been idle past the configured period with no live leases.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::runtime::Shutdown;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

struct HostBucket {
    /// Fair mutex: one waiter refills and sleeps at a time, so grants within
    /// a host are FIFO.
    gate: tokio::sync::Mutex<BucketState>,
    in_flight: AtomicUsize,
    last_used: parking_lot::Mutex<Instant>,
}

/// Per-host token buckets with a global concurrency cap.
pub struct HostLimiter {
    rate: f64,
    burst: f64,
    idle_eviction: Duration,
    global: Arc<Semaphore>,
    buckets: DashMap<String, Arc<HostBucket>>,
}

impl HostLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            rate: cfg.per_host_rate.max(0.001),
            burst: f64::from(cfg.per_host_burst.max(1)),
            idle_eviction: Duration::from_secs(cfg.idle_eviction_seconds),
            global: Arc::new(Semaphore::new(cfg.global_in_flight.max(1))),
            buckets: DashMap::new(),
        }
    }

    /// Block until a fetch to `host` is allowed, or fail with `Canceled`
    /// when the shutdown signal fires first.
    pub async fn acquire(&self, host: &str, shutdown: &Shutdown) -> Result<HostLease> {
        self.acquire_weighted(host, 1, shutdown).await
    }

    pub async fn acquire_weighted(
        &self,
        host: &str,
        weight: u32,
        shutdown: &Shutdown,
    ) -> Result<HostLease> {
        let bucket = self
            .buckets
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostBucket {
                    gate: tokio::sync::Mutex::new(BucketState {
                        tokens: self.burst,
                        last_refill: Instant::now(),
                    }),
                    in_flight: AtomicUsize::new(0),
                    last_used: parking_lot::Mutex::new(Instant::now()),
                })
            })
            .clone();
        *bucket.last_used.lock() = Instant::now();

        let needed = f64::from(weight.max(1));

        // Host tokens, FIFO within the host.
        {
            let mut state = tokio::select! {
                guard = bucket.gate.lock() => guard,
                _ = shutdown.wait() => return Err(Error::Canceled),
            };
            loop {
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.last_refill = now;

                if state.tokens >= needed {
                    state.tokens -= needed;
                    break;
                }

                let deficit = needed - state.tokens;
                let wait = Duration::from_secs_f64(deficit / self.rate);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.wait() => return Err(Error::Canceled),
                }
            }
        }

        // Global in-flight permit.
        let permit = tokio::select! {
            permit = self.global.clone().acquire_owned() => {
                permit.map_err(|_| Error::Canceled)?
            }
            _ = shutdown.wait() => return Err(Error::Canceled),
        };

        bucket.in_flight.fetch_add(1, Ordering::SeqCst);
        *bucket.last_used.lock() = Instant::now();
        Ok(HostLease {
            bucket,
            _permit: permit,
        })
    }

    /// Remove buckets with no in-flight leases that have been idle past the
    /// eviction period. Called by the runtime maintenance task.
    pub fn evict_idle(&self) {
        let now = Instant::now();
        let idle = self.idle_eviction;
        self.buckets.retain(|_, bucket| {
            bucket.in_flight.load(Ordering::SeqCst) > 0
                || now.duration_since(*bucket.last_used.lock()) < idle
        });
    }

    /// Number of tracked host buckets.
    pub fn tracked_hosts(&self) -> usize {
        self.buckets.len()
    }

    /// Unused global capacity.
    pub fn available_global(&self) -> usize {
        self.global.available_permits()
    }
}

/// Claim on one outbound fetch slot. Dropping it returns the global permit
/// and the host's in-flight accounting.
pub struct HostLease {
    bucket: Arc<HostBucket>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for HostLease {
    fn drop(&mut self) {
        self.bucket.in_flight.fetch_sub(1, Ordering::SeqCst);
        *self.bucket.last_used.lock() = Instant::now();
    }
}
