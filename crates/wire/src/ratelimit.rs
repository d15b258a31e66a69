//! Per-key token-bucket rate limiting.
//!
//! Buckets refill continuously at the configured rate, capped at the
//! configured burst. One bucket per API key, created on first use.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Instant;

/// Refill rate and burst capacity.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub rate: f64,
    /// Maximum tokens a bucket holds.
    pub burst: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            rate: 100.0,
            burst: 200.0,
        }
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(burst: f64) -> Self {
        TokenBucket {
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self, config: RateLimitConfig) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * config.rate).min(config.burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// All buckets, keyed by API key.
pub struct RateLimiterRegistry {
    config: RateLimitConfig,
    buckets: DashMap<String, Mutex<TokenBucket>>,
}

impl RateLimiterRegistry {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiterRegistry {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Take one token for `key`. False when the bucket is empty.
    pub fn try_acquire(&self, key: &str) -> bool {
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(self.config.burst)));
        let acquired = bucket.lock().try_acquire(self.config);
        acquired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_exhaustion() {
        let registry = RateLimiterRegistry::new(RateLimitConfig {
            rate: 0.0001,
            burst: 3.0,
        });
        assert!(registry.try_acquire("k"));
        assert!(registry.try_acquire("k"));
        assert!(registry.try_acquire("k"));
        assert!(!registry.try_acquire("k"));
    }

    #[test]
    fn test_keys_are_independent() {
        let registry = RateLimiterRegistry::new(RateLimitConfig {
            rate: 0.0001,
            burst: 1.0,
        });
        assert!(registry.try_acquire("a"));
        assert!(!registry.try_acquire("a"));
        assert!(registry.try_acquire("b"));
    }

    #[test]
    fn test_continuous_refill() {
        let registry = RateLimiterRegistry::new(RateLimitConfig {
            rate: 1000.0,
            burst: 1.0,
        });
        assert!(registry.try_acquire("k"));
        assert!(!registry.try_acquire("k"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(registry.try_acquire("k"));
    }
}
