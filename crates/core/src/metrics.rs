use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight in-memory metrics using atomic counters.
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub total_errors: AtomicU64,
    pub rate_limited: AtomicU64,
    pub quota_rejected: AtomicU64,
    pub auth_rejected: AtomicU64,
    /// Usage events overwritten because the ring was full.
    pub dropped_usage_events: AtomicU64,
    total_bytes_in: AtomicU64,
    total_bytes_out: AtomicU64,
    /// Per-route request counts.
    route_counts: RwLock<HashMap<String, AtomicU64>>,
    /// Per-error-kind counts.
    error_counts: RwLock<HashMap<String, AtomicU64>>,
    /// Latency histogram buckets (ms): <10, <50, <100, <500, <5000, >=5000.
    pub latency_buckets: [AtomicU64; 6],
    total_latency_ms: AtomicU64,
    created_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            quota_rejected: AtomicU64::new(0),
            auth_rejected: AtomicU64::new(0),
            dropped_usage_events: AtomicU64::new(0),
            total_bytes_in: AtomicU64::new(0),
            total_bytes_out: AtomicU64::new(0),
            route_counts: RwLock::new(HashMap::new()),
            error_counts: RwLock::new(HashMap::new()),
            latency_buckets: Default::default(),
            total_latency_ms: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    pub fn record_request(&self, route_id: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        increment_map(&self.route_counts, route_id);
    }

    pub fn record_error(&self, kind: &str) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        increment_map(&self.error_counts, kind);
        match kind {
            "rate_limit_exceeded" => {
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
            }
            "quota_exceeded" => {
                self.quota_rejected.fetch_add(1, Ordering::Relaxed);
            }
            "missing_api_key" | "invalid_api_key" | "key_revoked" | "key_expired"
            | "user_suspended" => {
                self.auth_rejected.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_dropped_usage_event(&self) {
        self.dropped_usage_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes_in: u64, bytes_out: u64) {
        self.total_bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.total_bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub fn record_latency_ms(&self, ms: u64) {
        let bucket = match ms {
            0..=9 => 0,
            10..=49 => 1,
            50..=99 => 2,
            100..=499 => 3,
            500..=4999 => 4,
            _ => 5,
        };
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Snapshot current metrics as a JSON-serializable value.
    pub fn snapshot(&self) -> serde_json::Value {
        let total_reqs = self.total_requests.load(Ordering::Relaxed);
        let total_errs = self.total_errors.load(Ordering::Relaxed);
        let uptime_secs = self.created_at.elapsed().as_secs();

        let error_rate = if total_reqs > 0 {
            total_errs as f64 / total_reqs as f64
        } else {
            0.0
        };
        let avg_latency = if total_reqs > 0 {
            self.total_latency_ms.load(Ordering::Relaxed) as f64 / total_reqs as f64
        } else {
            0.0
        };

        serde_json::json!({
            "total_requests": total_reqs,
            "total_errors": total_errs,
            "rate_limited": self.rate_limited.load(Ordering::Relaxed),
            "quota_rejected": self.quota_rejected.load(Ordering::Relaxed),
            "auth_rejected": self.auth_rejected.load(Ordering::Relaxed),
            "dropped_usage_events": self.dropped_usage_events.load(Ordering::Relaxed),
            "total_bytes_in": self.total_bytes_in.load(Ordering::Relaxed),
            "total_bytes_out": self.total_bytes_out.load(Ordering::Relaxed),
            "latency_ms": {
                "<10": self.latency_buckets[0].load(Ordering::Relaxed),
                "10-49": self.latency_buckets[1].load(Ordering::Relaxed),
                "50-99": self.latency_buckets[2].load(Ordering::Relaxed),
                "100-499": self.latency_buckets[3].load(Ordering::Relaxed),
                "500-4999": self.latency_buckets[4].load(Ordering::Relaxed),
                ">=5000": self.latency_buckets[5].load(Ordering::Relaxed),
            },
            "by_route": snapshot_map(&self.route_counts),
            "by_error": snapshot_map(&self.error_counts),
            "avg_latency_ms": avg_latency,
            "error_rate": error_rate,
            "uptime_seconds": uptime_secs,
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn increment_map(map: &RwLock<HashMap<String, AtomicU64>>, key: &str) {
    // Fast path: read lock
    if let Ok(m) = map.read()
        && let Some(counter) = m.get(key)
    {
        counter.fetch_add(1, Ordering::Relaxed);
        return;
    }
    // Slow path: write lock to insert
    if let Ok(mut m) = map.write() {
        m.entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }
}

fn snapshot_map(map: &RwLock<HashMap<String, AtomicU64>>) -> serde_json::Value {
    let mut result = serde_json::Map::new();
    if let Ok(m) = map.read() {
        for (k, v) in m.iter() {
            result.insert(
                k.clone(),
                serde_json::Value::Number(v.load(Ordering::Relaxed).into()),
            );
        }
    }
    serde_json::Value::Object(result)
}
