use chrono::{DateTime, Utc};
use std::time::Instant;

/// Per-request context carried through the pipeline: correlation id,
/// timing, and client address. Injected as an axum `Extension` by the
/// outermost middleware; later stages attach identity and route data via
/// their own extensions.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id (UUID v4), echoed back as `X-Request-ID` and used
    /// in panic/error logs.
    pub request_id: String,
    /// Monotonic start for latency measurement.
    pub started: Instant,
    /// Wall-clock receive time stamped onto usage events.
    pub received_at: DateTime<Utc>,
    /// Client IP as reported by `X-Forwarded-For`/`X-Real-IP`.
    pub client_ip: Option<String>,
}

impl RequestContext {
    pub fn new(client_ip: Option<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            started: Instant::now(),
            received_at: Utc::now(),
            client_ip,
        }
    }

    /// Milliseconds since the request entered the pipeline.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = RequestContext::new(None);
        let b = RequestContext::new(Some("10.0.0.1".into()));
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(b.client_ip.as_deref(), Some("10.0.0.1"));
    }
}
