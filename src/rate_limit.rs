use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Entries not accessed for this many seconds are eligible for eviction.
const GC_EXPIRE_SECS: u64 = 300;
/// GC runs every this many seconds.
const GC_INTERVAL_SECS: u64 = 60;
/// Hard cap on per-host bucket cardinality. Beyond this, the oldest idle
/// entries are force-evicted regardless of last-access time.
const MAX_ENTRIES: usize = 10_000;

const PRECISION: u64 = 1_000_000;

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

/// Token bucket, `tokio::sync::Mutex`-protected so that contention yields
/// back to the runtime instead of blocking a worker thread. A CAS-based
/// bucket would let only the winner of the refill race add tokens, which
/// silently drops the effective refill rate under concurrent load.
struct Bucket {
    inner: Mutex<BucketInner>,
    last_access: AtomicU64,
}

struct BucketInner {
    tokens: u64,
    last_refill: u64,
    rate_per_us: f64,
    max_tokens: u64,
}

impl Bucket {
    fn new(rate: f64) -> Self {
        let now = now_us();
        let max_tokens = (rate.max(1.0) as u64) * PRECISION;
        Self {
            inner: Mutex::new(BucketInner {
                tokens: max_tokens,
                last_refill: now,
                rate_per_us: rate / 1_000_000.0,
                max_tokens,
            }),
            last_access: AtomicU64::new(now),
        }
    }

    async fn try_acquire(&self) -> bool {
        let now = now_us();
        let mut b = self.inner.lock().await;

        let elapsed = now.saturating_sub(b.last_refill);
        if elapsed > 0 {
            let refill = (elapsed as f64 * b.rate_per_us * PRECISION as f64) as u64;
            b.tokens = (b.tokens + refill).min(b.max_tokens);
            b.last_refill = now;
        }

        if b.tokens >= PRECISION {
            b.tokens -= PRECISION;
            true
        } else {
            false
        }
    }
}

/// Global + per-host token-bucket admission control for one listener.
///
/// Capacity equals the configured rate (a 1-second burst). A rate of 0
/// disables that dimension (always allow). The per-host map is bounded in
/// cardinality; a background task evicts idle entries so a listener facing
/// many distinct source IPs does not grow the map without bound.
pub struct RateLimiter {
    global: Option<Bucket>,
    per_host: DashMap<IpAddr, Arc<Bucket>>,
    per_host_rate: f64,
}

impl RateLimiter {
    pub fn new(global_rps: u32, per_host_rps: u32) -> Self {
        Self {
            global: if global_rps > 0 {
                Some(Bucket::new(global_rps as f64))
            } else {
                None
            },
            per_host: DashMap::new(),
            per_host_rate: per_host_rps as f64,
        }
    }

    /// Consumes one token from the global bucket. Always `true` if the
    /// listener has no global rate configured.
    pub async fn allow_global(&self) -> bool {
        match &self.global {
            Some(b) => b.try_acquire().await,
            None => true,
        }
    }

    /// Consumes one token from the bucket keyed by `addr`. Always `true`
    /// if the listener has no per-host rate configured.
    pub async fn allow_host(&self, addr: IpAddr) -> bool {
        if self.per_host_rate <= 0.0 {
            return true;
        }

        let bucket = if let Some(entry) = self.per_host.get(&addr) {
            entry.value().clone()
        } else {
            self.per_host
                .entry(addr)
                .or_insert_with(|| Arc::new(Bucket::new(self.per_host_rate)))
                .clone()
        };

        bucket.last_access.store(now_us(), Ordering::Relaxed);
        bucket.try_acquire().await
    }

    /// Spawn a background task that periodically evicts idle per-host
    /// buckets. Call once after construction.
    pub fn start_gc(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                limiter.evict_stale();
            }
        });
    }

    fn evict_stale(&self) {
        let now = now_us();
        let expire_us = GC_EXPIRE_SECS * 1_000_000;

        self.per_host
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);

        if self.per_host.len() > MAX_ENTRIES {
            self.force_evict(now);
        }
    }

    fn force_evict(&self, now: u64) {
        let overflow = self.per_host.len().saturating_sub(MAX_ENTRIES);
        if overflow == 0 {
            return;
        }
        let mut entries: Vec<(IpAddr, u64)> = self
            .per_host
            .iter()
            .map(|r| {
                let age = now.saturating_sub(r.value().last_access.load(Ordering::Relaxed));
                (*r.key(), age)
            })
            .collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        for (key, _) in entries.into_iter().take(overflow) {
            self.per_host.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn global_allows_burst_up_to_capacity() {
        let rl = RateLimiter::new(10, 0);
        let mut allowed = 0;
        for _ in 0..20 {
            if rl.allow_global().await {
                allowed += 1;
            }
        }
        assert!(allowed >= 10, "expected at least 10 allowed, got {}", allowed);
    }

    #[tokio::test]
    async fn zero_rate_means_unlimited() {
        let rl = RateLimiter::new(0, 0);
        for _ in 0..1000 {
            assert!(rl.allow_global().await);
        }
    }

    #[tokio::test]
    async fn rejects_after_burst_exhausted() {
        let rl = RateLimiter::new(1, 0);
        let mut allowed = 0;
        for _ in 0..50 {
            if rl.allow_global().await {
                allowed += 1;
            }
        }
        assert!(allowed < 10, "expected most requests rejected, got {}", allowed);
    }

    #[tokio::test]
    async fn per_host_keys_are_independent() {
        let rl = RateLimiter::new(0, 1);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(rl.allow_host(a).await);
        assert!(!rl.allow_host(a).await);
        // A different source IP has its own bucket, unaffected by `a`'s.
        assert!(rl.allow_host(b).await);
    }

    #[tokio::test]
    async fn capacity_refills_after_one_second() {
        let rl = RateLimiter::new(1, 0);
        assert!(rl.allow_global().await);
        assert!(!rl.allow_global().await);
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(rl.allow_global().await);
    }
}
