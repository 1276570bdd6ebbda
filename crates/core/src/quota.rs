//! Monthly quota enforcement against the rolling usage aggregate.
//!
//! A read-through cache keeps the current period's request count per user
//! so the hot path never hits the store. The count is advanced locally on
//! each successful proxied response; the usage flusher reconciles with the
//! persisted aggregates over time.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use crate::model::{next_period_start, period_for};
use crate::store::{StoreError, UsageStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed,
    Exceeded { retry_after_secs: u64 },
}

#[derive(Debug)]
struct QuotaEntry {
    period: String,
    count: i64,
}

/// Per-user quota counters. The outer map lock is held only to fetch the
/// per-user latch; the latch serialises period roll-over and the store
/// read-through.
pub struct QuotaGate {
    entries: RwLock<HashMap<String, Arc<Mutex<QuotaEntry>>>>,
}

impl QuotaGate {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Check whether `user_id` may spend one more request this month.
    /// `limit < 0` bypasses the check entirely.
    pub async fn check(
        &self,
        usage: &dyn UsageStore,
        user_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, StoreError> {
        if limit < 0 {
            return Ok(QuotaDecision::Allowed);
        }

        let entry = self.entry_for(user_id);
        let mut entry = entry.lock().await;

        let period = period_for(now);
        if entry.period != period {
            // Roll-over (or first touch): refresh from the aggregates store.
            let persisted = usage
                .get_aggregate(user_id, &period)
                .await?
                .map(|a| a.requests as i64)
                .unwrap_or(0);
            entry.period = period;
            entry.count = persisted;
        }

        if entry.count >= limit {
            let retry_after = (next_period_start(now) - now).num_seconds().max(1) as u64;
            return Ok(QuotaDecision::Exceeded {
                retry_after_secs: retry_after,
            });
        }
        Ok(QuotaDecision::Allowed)
    }

    /// Advance the local count after a request actually reached the
    /// upstream. Never touches the store.
    pub async fn advance(&self, user_id: &str, now: DateTime<Utc>) {
        let entry = self.entry_for(user_id);
        let mut entry = entry.lock().await;
        if entry.period == period_for(now) {
            entry.count += 1;
        }
    }

    /// Drop a user's cached counter (plan change, manual reset).
    pub fn invalidate(&self, user_id: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(user_id);
        }
    }

    /// Drop every cached counter (settings reload).
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    fn entry_for(&self, user_id: &str) -> Arc<Mutex<QuotaEntry>> {
        // Fast path: read lock
        {
            let entries = self.entries.read().unwrap();
            if let Some(entry) = entries.get(user_id) {
                return Arc::clone(entry);
            }
        }
        // Slow path: write lock to insert
        let mut entries = self.entries.write().unwrap();
        Arc::clone(entries.entry(user_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(QuotaEntry {
                period: String::new(),
                count: 0,
            }))
        }))
    }
}

impl Default for QuotaGate {
    fn default() -> Self {
        Self::new()
    }
}
