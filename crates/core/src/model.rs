//! Domain entities shared across the gateway: identities, plans, routes,
//! upstreams, and usage records.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─── Identity ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub plan_id: String,
    pub status: UserStatus,
    /// Bcrypt hash; only set for users that can open an admin session.
    #[serde(default)]
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    /// Clear-text lookup prefix (scheme marker + 9 random chars).
    pub prefix: String,
    /// Slow hash over the whole raw key; see `keys::hash_key`.
    pub key_hash: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// A key is active iff it was never revoked and has not expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.is_none_or(|t| t > now)
    }
}

/// The (user, key, plan) triple resolved by authentication.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user: User,
    pub key: ApiKey,
    pub plan: Plan,
}

// ─── Plans ─────────────────────────────────────────────────────────────────

/// A named capability attached to a plan, optionally projected into an
/// upstream header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    pub name: String,
    #[serde(default)]
    pub header: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub rate_limit_per_minute: u32,
    /// -1 means unlimited.
    pub requests_per_month: i64,
    #[serde(default)]
    pub price_monthly_cents: i64,
    #[serde(default)]
    pub price_overage_cents: i64,
    #[serde(default)]
    pub entitlements: Vec<Entitlement>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub is_default: bool,
}

impl Plan {
    pub fn is_unlimited(&self) -> bool {
        self.requests_per_month < 0
    }
}

// ─── Routes & upstreams ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Prefix,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Http,
    HttpStream,
    Sse,
    Websocket,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Http
    }
}

/// Declarative rewrite applied to the outbound request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestTransform {
    #[serde(default)]
    pub set_headers: HashMap<String, String>,
    #[serde(default)]
    pub remove_headers: Vec<String>,
    /// Template over path params and identity fields; replaces the body.
    #[serde(default)]
    pub body_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMapping {
    pub from: u16,
    pub to: u16,
}

/// Declarative rewrite applied to the inbound response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseTransform {
    #[serde(default)]
    pub set_headers: HashMap<String, String>,
    #[serde(default)]
    pub remove_headers: Vec<String>,
    #[serde(default)]
    pub status_map: Vec<StatusMapping>,
    /// Replacement body; applied only when the response was buffered.
    #[serde(default)]
    pub body_replace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    pub match_type: MatchType,
    pub path_pattern: String,
    /// Empty means any method.
    #[serde(default)]
    pub methods: Vec<String>,
    pub upstream_id: String,
    /// Literal target path or a pattern substituting `{param}` captures.
    #[serde(default)]
    pub path_rewrite: Option<String>,
    #[serde(default)]
    pub method_override: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub request_transform: Option<RequestTransform>,
    #[serde(default)]
    pub response_transform: Option<ResponseTransform>,
    /// Compute-unit expression; `None` meters one unit per request.
    #[serde(default)]
    pub metering: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,
    /// Optional egress proxy (http/https/socks5).
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_pool_max_idle() -> usize {
    8
}

// ─── Usage ─────────────────────────────────────────────────────────────────

/// A single metered request. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub ts: DateTime<Utc>,
    pub user_id: String,
    pub key_id: String,
    pub route_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub compute_units: f64,
    /// Error kind code when the request terminated with a gateway error.
    #[serde(default)]
    pub error: Option<String>,
}

/// Increment applied to a monthly aggregate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageDelta {
    pub requests: u64,
    pub compute_units: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub errors: u64,
    pub latency_ms_total: u64,
}

impl UsageDelta {
    pub fn from_event(event: &UsageEvent) -> Self {
        Self {
            requests: 1,
            compute_units: event.compute_units,
            bytes_in: event.bytes_in,
            bytes_out: event.bytes_out,
            errors: u64::from(event.error.is_some()),
            latency_ms_total: event.latency_ms,
        }
    }

    pub fn merge(&mut self, other: &UsageDelta) {
        self.requests += other.requests;
        self.compute_units += other.compute_units;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.errors += other.errors;
        self.latency_ms_total += other.latency_ms_total;
    }
}

/// Per-user monthly roll-up used for quota checks and billing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageAggregate {
    pub user_id: String,
    /// UTC calendar month, `YYYY-MM`.
    pub period: String,
    pub requests: u64,
    pub compute_units: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub errors: u64,
    pub latency_ms_total: u64,
}

impl UsageAggregate {
    pub fn mean_latency_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.latency_ms_total as f64 / self.requests as f64
        }
    }
}

/// The UTC calendar-month period a timestamp falls into.
pub fn period_for(ts: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", ts.year(), ts.month())
}

/// Start of the month following `now`, i.e. when the current quota period
/// rolls over.
pub fn next_period_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_key_active_states() {
        let now = Utc::now();
        let key = ApiKey {
            id: "k1".into(),
            user_id: "u1".into(),
            prefix: "ak_abc123xyz".into(),
            key_hash: "$2b$..".into(),
            name: String::new(),
            expires_at: None,
            revoked_at: None,
            created_at: now,
        };
        assert!(key.is_active(now));

        let expired = ApiKey {
            expires_at: Some(now - Duration::hours(1)),
            ..key.clone()
        };
        assert!(!expired.is_active(now));

        let revoked = ApiKey {
            revoked_at: Some(now),
            ..key.clone()
        };
        assert!(!revoked.is_active(now));

        let future_expiry = ApiKey {
            expires_at: Some(now + Duration::hours(1)),
            ..key
        };
        assert!(future_expiry.is_active(now));
    }

    #[test]
    fn test_period_formatting() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        assert_eq!(period_for(ts), "2026-03");
    }

    #[test]
    fn test_next_period_rollover() {
        let ts = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
        let next = next_period_start(ts);
        assert_eq!(period_for(next), "2027-01");

        let mid = Utc.with_ymd_and_hms(2026, 5, 10, 0, 0, 0).unwrap();
        assert_eq!(period_for(next_period_start(mid)), "2026-06");
    }

    #[test]
    fn test_delta_merge() {
        let event = UsageEvent {
            ts: Utc::now(),
            user_id: "u1".into(),
            key_id: "k1".into(),
            route_id: "r1".into(),
            method: "GET".into(),
            path: "/api/data".into(),
            status: 200,
            latency_ms: 40,
            bytes_in: 100,
            bytes_out: 250,
            compute_units: 1.0,
            error: None,
        };
        let mut delta = UsageDelta::from_event(&event);
        let failed = UsageEvent {
            status: 429,
            error: Some("rate_limit_exceeded".into()),
            ..event
        };
        delta.merge(&UsageDelta::from_event(&failed));

        assert_eq!(delta.requests, 2);
        assert_eq!(delta.errors, 1);
        assert_eq!(delta.bytes_out, 500);
        assert_eq!(delta.latency_ms_total, 80);
    }

    #[test]
    fn test_unlimited_plan() {
        let plan = Plan {
            id: "p1".into(),
            name: "Metal".into(),
            rate_limit_per_minute: 600,
            requests_per_month: -1,
            price_monthly_cents: 0,
            price_overage_cents: 0,
            entitlements: vec![],
            enabled: true,
            is_default: false,
        };
        assert!(plan.is_unlimited());
    }
}
