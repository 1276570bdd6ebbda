//! Per-identity token-bucket admission with continuous refill.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

/// Refill window in seconds: capacity tokens per window.
const WINDOW_SECS: f64 = 60.0;
/// Number of independent bucket shards; admits for distinct identities
/// never contend on the same lock.
const SHARDS: usize = 64;
/// Buckets idle longer than this are evicted by `evict_idle`.
const IDLE_EVICT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Floor for bucket capacity; plans below this still burst to it.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            burst: 0,
        }
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    pub limit: u32,
    /// Whole tokens left after this admit.
    pub remaining: u32,
    /// Seconds until the bucket is back at capacity.
    pub reset_secs: u64,
    /// Seconds until one token is available again; zero when allowed.
    pub retry_after_secs: u64,
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Sharded token-bucket table keyed by user id.
pub struct RateLimiter {
    shards: Vec<Mutex<HashMap<String, Bucket>>>,
    config: RwLock<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            config: RwLock::new(config),
        }
    }

    /// Swap in new limiter settings (called on settings reload).
    pub fn update_config(&self, config: RateLimitConfig) {
        if let Ok(mut cfg) = self.config.write() {
            *cfg = config;
        }
    }

    /// Admit one request for `user_id` under a plan rate of
    /// `rate_per_minute`. `now` is a monotonic instant so admission never
    /// goes backwards under wall-clock adjustments.
    pub fn admit(&self, user_id: &str, rate_per_minute: u32, now: Instant) -> Admission {
        let (enabled, burst) = {
            let cfg = self.config.read().unwrap();
            (cfg.enabled, cfg.burst)
        };
        let capacity = rate_per_minute.max(burst).max(1);

        if !enabled {
            return Admission {
                allowed: true,
                limit: capacity,
                remaining: capacity,
                reset_secs: 0,
                retry_after_secs: 0,
            };
        }

        let mut shard = self.shards[shard_index(user_id)].lock().unwrap();
        let bucket = shard.entry(user_id.to_string()).or_insert(Bucket {
            tokens: capacity as f64,
            last: now,
        });

        // Continuous refill since the last admit, clamped to capacity.
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * capacity as f64 / WINDOW_SECS).min(capacity as f64);
        bucket.last = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Admission {
                allowed: true,
                limit: capacity,
                remaining: bucket.tokens.floor() as u32,
                reset_secs: reset_secs(bucket.tokens, capacity),
                retry_after_secs: 0,
            }
        } else {
            let deficit = 1.0 - bucket.tokens;
            Admission {
                allowed: false,
                limit: capacity,
                remaining: 0,
                reset_secs: reset_secs(bucket.tokens, capacity),
                retry_after_secs: (deficit * WINDOW_SECS / capacity as f64).ceil() as u64,
            }
        }
    }

    /// Drop buckets that have not been touched for the idle window.
    /// Called periodically from a janitor task.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            let before = shard.len();
            shard.retain(|_, b| now.saturating_duration_since(b.last) < IDLE_EVICT);
            evicted += before - shard.len();
        }
        evicted
    }

    /// Number of live buckets across all shards.
    pub fn bucket_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }
}

fn shard_index(user_id: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    (hasher.finish() as usize) % SHARDS
}

fn reset_secs(tokens: f64, capacity: u32) -> u64 {
    let missing = (capacity as f64 - tokens).max(0.0);
    (missing * WINDOW_SECS / capacity as f64).ceil() as u64
}
