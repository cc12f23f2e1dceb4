use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Per-principal token bucket. Advisory, in-process: capacity equals the
/// per-minute refill rate, keyed by user id. Durable state lives in the
/// database; this only smooths request bursts.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Rate limit status for a given key, shaped for response headers.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub allowed: bool,
    pub limit: usize,
    pub remaining: usize,
    /// Seconds until a token becomes available. 0 if there is capacity.
    pub retry_after_secs: u64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token from `key`'s bucket, refilled at `per_minute` tokens per
    /// minute up to a capacity of `per_minute`.
    pub fn check_with_info(&self, key: &str, per_minute: usize) -> RateLimitInfo {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let capacity = per_minute as f64;
        let refill_per_sec = capacity / 60.0;

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            let deficit = 1.0 - bucket.tokens;
            let retry_after = (deficit / refill_per_sec).ceil() as u64;
            return RateLimitInfo {
                allowed: false,
                limit: per_minute,
                remaining: 0,
                retry_after_secs: retry_after.max(1),
            };
        }

        bucket.tokens -= 1.0;
        RateLimitInfo {
            allowed: true,
            limit: per_minute,
            remaining: bucket.tokens as usize,
            retry_after_secs: 0,
        }
    }

    pub fn check(&self, key: &str, per_minute: usize) -> bool {
        self.check_with_info(key, per_minute).allowed
    }
}
