//! API-key validation: extraction, format check, prefix-scoped candidate
//! lookup, slow hash verification, and a fingerprint-keyed outcome cache.
//!
//! Positive entries carry the full (user, key, plan) identity under a
//! 60 s TTL; negative entries remember the error kind under a shorter
//! TTL so repeated bad keys never reach bcrypt. Revocation, suspension,
//! and settings reloads invalidate eagerly.

use arc_swap::ArcSwap;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;

use tollgate_core::config::RuntimeSettings;
use tollgate_core::error::GatewayError;
use tollgate_core::keys;
use tollgate_core::model::Identity;
use tollgate_core::store::Store;

/// Pull the raw key out of the configured header or `Authorization:
/// Bearer`. `auth_header` must be lowercase.
pub fn extract_key<'a>(headers: &'a HeaderMap, auth_header: &str) -> Option<&'a str> {
    headers
        .get(auth_header)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

struct ValidatorCaches {
    positive: Cache<String, Arc<Identity>>,
    negative: Cache<String, GatewayError>,
}

impl ValidatorCaches {
    fn build(settings: &RuntimeSettings) -> Self {
        Self {
            positive: Cache::builder()
                .max_capacity(settings.validation_cache_capacity)
                .time_to_live(Duration::from_secs(settings.validation_positive_ttl_secs.max(1)))
                .build(),
            negative: Cache::builder()
                .max_capacity(settings.validation_cache_capacity)
                .time_to_live(Duration::from_secs(settings.validation_negative_ttl_secs.max(1)))
                .build(),
        }
    }
}

pub struct KeyValidator {
    caches: ArcSwap<ValidatorCaches>,
}

impl KeyValidator {
    pub fn new(settings: &RuntimeSettings) -> Self {
        Self {
            caches: ArcSwap::from_pointee(ValidatorCaches::build(settings)),
        }
    }

    /// Swap in fresh caches sized from new settings. Doubles as the
    /// settings-reload invalidation hook.
    pub fn reconfigure(&self, settings: &RuntimeSettings) {
        self.caches.store(Arc::new(ValidatorCaches::build(settings)));
    }

    /// Drop cached outcomes for one key id.
    pub fn invalidate_key(&self, key_id: &str) {
        let caches = self.caches.load();
        let stale: Vec<String> = caches
            .positive
            .iter()
            .filter(|(_, identity)| identity.key.id == key_id)
            .map(|(fp, _)| fp.as_ref().clone())
            .collect();
        for fp in stale {
            caches.positive.invalidate(&fp);
        }
    }

    /// Drop cached outcomes for every key owned by a user (suspension,
    /// plan change).
    pub fn invalidate_user(&self, user_id: &str) {
        let caches = self.caches.load();
        let stale: Vec<String> = caches
            .positive
            .iter()
            .filter(|(_, identity)| identity.user.id == user_id)
            .map(|(fp, _)| fp.as_ref().clone())
            .collect();
        for fp in stale {
            caches.positive.invalidate(&fp);
        }
    }

    /// Resolve a raw key to an identity.
    pub async fn validate(
        &self,
        store: &dyn Store,
        raw: &str,
        settings: &RuntimeSettings,
        now: DateTime<Utc>,
    ) -> Result<Identity, GatewayError> {
        // Single pass/fail format check; never reveal which part failed.
        let prefix = keys::parse(raw, &settings.key_scheme).ok_or(GatewayError::InvalidApiKey)?;

        let caches = self.caches.load_full();
        let fingerprint = keys::fingerprint(raw);

        if let Some(identity) = caches.positive.get(&fingerprint) {
            // Expiry can pass inside the TTL window; re-check cheaply.
            if identity.key.is_active(now) {
                return Ok((*identity).clone());
            }
            caches.positive.invalidate(&fingerprint);
        }
        if let Some(error) = caches.negative.get(&fingerprint) {
            return Err(error);
        }

        let outcome = self.verify_candidates(store, raw, prefix, now).await;
        match &outcome {
            Ok(identity) => {
                caches
                    .positive
                    .insert(fingerprint, Arc::new(identity.clone()));
            }
            // Store failures are transient; don't poison the cache.
            Err(GatewayError::Internal(_)) => {}
            Err(error) => {
                caches.negative.insert(fingerprint, error.clone());
            }
        }
        outcome
    }

    async fn verify_candidates(
        &self,
        store: &dyn Store,
        raw: &str,
        prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<Identity, GatewayError> {
        let candidates = store.list_keys_by_prefix(prefix).await?;

        // Live candidates first; revoked ones are only consulted to
        // report `key_revoked` accurately when nothing else matched.
        for key in candidates.iter().filter(|k| k.revoked_at.is_none()) {
            if !keys::verify_key(raw, &key.key_hash) {
                continue;
            }
            if let Some(expires_at) = key.expires_at
                && expires_at <= now
            {
                return Err(GatewayError::KeyExpired);
            }

            let user = store.get_user(&key.user_id).await?;
            if !user.is_active() {
                return Err(GatewayError::UserSuspended);
            }
            let plan = store.get_plan(&user.plan_id).await?;

            return Ok(Identity {
                user,
                key: key.clone(),
                plan,
            });
        }

        for key in candidates.iter().filter(|k| k.revoked_at.is_some()) {
            if keys::verify_key(raw, &key.key_hash) {
                return Err(GatewayError::KeyRevoked);
            }
        }

        Err(GatewayError::InvalidApiKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn settings() -> RuntimeSettings {
        RuntimeSettings::default()
    }

    #[test]
    fn test_extract_from_configured_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("ak_raw"));
        assert_eq!(extract_key(&headers, "x-api-key"), Some("ak_raw"));
    }

    #[test]
    fn test_extract_from_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer ak_raw"));
        assert_eq!(extract_key(&headers, "x-api-key"), Some("ak_raw"));
    }

    #[test]
    fn test_configured_header_wins_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("ak_one"));
        headers.insert("authorization", HeaderValue::from_static("Bearer ak_two"));
        assert_eq!(extract_key(&headers, "x-api-key"), Some("ak_one"));
    }

    #[test]
    fn test_extract_missing_or_empty() {
        let headers = HeaderMap::new();
        assert_eq!(extract_key(&headers, "x-api-key"), None);

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static(""));
        assert_eq!(extract_key(&headers, "x-api-key"), None);

        // Basic auth is not a bearer token.
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(extract_key(&headers, "x-api-key"), None);
    }

    #[test]
    fn test_reconfigure_drops_cached_entries() {
        let validator = KeyValidator::new(&settings());
        let caches = validator.caches.load();
        caches
            .negative
            .insert("fp".to_string(), GatewayError::InvalidApiKey);
        assert!(caches.negative.get("fp").is_some());
        drop(caches);

        validator.reconfigure(&settings());
        assert!(validator.caches.load().negative.get("fp").is_none());
    }
}
