// Token-bucket rate limiting (spec §4.1, §5). The teacher uses fixed
// windows (`RateEntry { count, start_ms }`); the spec calls for an actual
// token bucket with continuous refill, so the counting scheme changes but
// the shape — a `DashMap` keyed by contributor identity, with a periodic
// reclaimer evicting idle entries — is carried over directly from
// `eviction()` in the teacher.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct Bucket {
    tokens: f64,
    last_refill: std::time::Instant,
    last_touched: std::time::Instant,
}

impl Bucket {
    fn new(capacity: f64, now: std::time::Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_touched: now,
        }
    }
}

/// A named class of token bucket (ingest: 60/min; query: 30/min/user) per
/// spec §4.1 and §6.1.
pub struct TokenBucketLimiter {
    buckets: Arc<DashMap<String, Mutex<Bucket>>>,
    pub capacity: f64,
    refill_per_sec: f64,
    pub limit: u32,
    pub window: &'static str,
}

impl TokenBucketLimiter {
    pub fn new(capacity: u32, window_secs: u64, window_label: &'static str) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            capacity: capacity as f64,
            refill_per_sec: capacity as f64 / window_secs as f64,
            limit: capacity,
            window: window_label,
        }
    }

    /// Consume one token for `key`. Returns true if allowed.
    pub async fn try_acquire(&self, key: &str) -> bool {
        let now = std::time::Instant::now();
        let entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(Bucket::new(self.capacity, now)));
        let mut bucket = entry.lock().await;
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
        bucket.last_touched = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Remove buckets idle longer than `idle_window`. Run periodically from a
    /// background task (mirrors the teacher's `eviction()` loop).
    pub async fn evict_idle(&self, idle_window: Duration) {
        let now = std::time::Instant::now();
        let mut stale = Vec::new();
        for entry in self.buckets.iter() {
            let bucket = entry.value().lock().await;
            if now.saturating_duration_since(bucket.last_touched) > idle_window {
                stale.push(entry.key().clone());
            }
        }
        for key in stale {
            self.buckets.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }
}

/// Extract the rate-limit key for a request: the first hop of
/// `X-Forwarded-For` if present, else the socket's remote address (spec
/// §4.1 step 5; resolved Open Question in §9 — keyed by address, not
/// verified public key, since the gate must reject malformed/unauthenticated
/// requests before a key is known).
pub fn rate_limit_key(forwarded_for: Option<&str>, remote_addr: std::net::SocketAddr) -> String {
    match forwarded_for.and_then(|h| h.split(',').next()) {
        Some(first_hop) => first_hop.trim().to_string(),
        None => remote_addr.ip().to_string(),
    }
}

pub async fn run_reclaimer(limiter: Arc<TokenBucketLimiter>, idle_window: Duration) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let before = limiter.len();
        limiter.evict_idle(idle_window).await;
        let after = limiter.len();
        if before != after {
            tracing::info!(evicted = before - after, remaining = after, "ratelimit_eviction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_capacity_then_blocks() {
        let limiter = TokenBucketLimiter::new(3, 60, "1m");
        assert!(limiter.try_acquire("k").await);
        assert!(limiter.try_acquire("k").await);
        assert!(limiter.try_acquire("k").await);
        assert!(!limiter.try_acquire("k").await);
    }

    #[tokio::test]
    async fn separate_keys_have_separate_buckets() {
        let limiter = TokenBucketLimiter::new(1, 60, "1m");
        assert!(limiter.try_acquire("a").await);
        assert!(limiter.try_acquire("b").await);
        assert!(!limiter.try_acquire("a").await);
    }

    #[test]
    fn rate_limit_key_prefers_forwarded_for_first_hop() {
        let addr: std::net::SocketAddr = "10.0.0.1:1234".parse().unwrap();
        assert_eq!(
            rate_limit_key(Some("203.0.113.1, 10.0.0.2"), addr),
            "203.0.113.1"
        );
        assert_eq!(rate_limit_key(None, addr), "10.0.0.1");
    }
}
