//! Configuration layering.
//!
//! Bootstrap values (store DSN, bind address, log level/format) come from
//! the CLI/environment only. Everything else lives in the settings store
//! and is published as an immutable [`RuntimeSettings`] snapshot behind an
//! `ArcSwap`; mutations go through the store and are republished with a
//! version bump, so the hot path never reads the store.
//!
//! A legacy YAML seed file can populate an empty store at first boot and
//! is watched for changes afterwards; the store stays authoritative.

use arc_swap::ArcSwap;
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::model::{Plan, Route, Upstream};
use crate::rate_limit::RateLimitConfig;
use crate::store::{SettingsStore, StoreError};
use crate::usage::RecorderConfig;

// ─── Runtime settings snapshot ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    None,
    Manual,
    Acme,
}

#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub mode: TlsMode,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    /// Domains served in ACME mode; cert bundles live in the TLS cache.
    pub domains: Vec<String>,
}

/// Immutable snapshot of every runtime-tunable knob.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Header the raw API key is read from (besides `Authorization: Bearer`).
    pub auth_header: String,
    /// Scheme marker raw keys must start with.
    pub key_scheme: String,
    pub bcrypt_cost: u32,

    pub rate_limit_enabled: bool,
    pub rate_limit_burst: u32,

    pub validation_positive_ttl_secs: u64,
    pub validation_negative_ttl_secs: u64,
    pub validation_cache_capacity: u64,

    /// Inbound request body limit.
    pub body_limit_mb: usize,
    /// Cap on buffered upstream response bodies.
    pub buffer_cap_mb: usize,

    pub usage_ring_capacity: usize,
    pub usage_batch_size: usize,
    pub usage_flush_interval_ms: u64,
    pub usage_shutdown_grace_secs: u64,

    pub admin_email: Option<String>,
    pub admin_password_hash: Option<String>,
    pub admin_jwt_secret: Option<String>,
    pub admin_jwt_ttl_secs: u64,

    pub tls: TlsSettings,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            auth_header: "x-api-key".to_string(),
            key_scheme: "ak_".to_string(),
            bcrypt_cost: crate::keys::DEFAULT_BCRYPT_COST,
            rate_limit_enabled: true,
            rate_limit_burst: 0,
            validation_positive_ttl_secs: 60,
            validation_negative_ttl_secs: 5,
            validation_cache_capacity: 10_000,
            body_limit_mb: 10,
            buffer_cap_mb: 4,
            usage_ring_capacity: 8192,
            usage_batch_size: 256,
            usage_flush_interval_ms: 1000,
            usage_shutdown_grace_secs: 5,
            admin_email: None,
            admin_password_hash: None,
            admin_jwt_secret: None,
            admin_jwt_ttl_secs: 3600,
            tls: TlsSettings {
                mode: TlsMode::None,
                cert_path: None,
                key_path: None,
                domains: Vec::new(),
            },
        }
    }
}

impl RuntimeSettings {
    /// Build a snapshot from the flat settings namespace, falling back to
    /// defaults for missing or unparsable values.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let defaults = Self::default();

        fn parse<T: std::str::FromStr>(
            map: &HashMap<String, String>,
            key: &str,
            default: T,
        ) -> T {
            map.get(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let tls_mode = match map.get("tls.mode").map(String::as_str) {
            Some("manual") => TlsMode::Manual,
            Some("acme") => TlsMode::Acme,
            _ => TlsMode::None,
        };

        Self {
            auth_header: map
                .get("auth.header")
                .map(|h| h.to_lowercase())
                .unwrap_or(defaults.auth_header),
            key_scheme: map
                .get("keys.scheme")
                .cloned()
                .filter(|s| s.len() == crate::keys::SCHEME_LEN)
                .unwrap_or(defaults.key_scheme),
            bcrypt_cost: parse(map, "keys.bcrypt_cost", defaults.bcrypt_cost),
            rate_limit_enabled: parse(map, "rate_limit.enabled", defaults.rate_limit_enabled),
            rate_limit_burst: parse(map, "rate_limit.burst", defaults.rate_limit_burst),
            validation_positive_ttl_secs: parse(
                map,
                "validation.positive_ttl_secs",
                defaults.validation_positive_ttl_secs,
            ),
            validation_negative_ttl_secs: parse(
                map,
                "validation.negative_ttl_secs",
                defaults.validation_negative_ttl_secs,
            ),
            validation_cache_capacity: parse(
                map,
                "validation.cache_capacity",
                defaults.validation_cache_capacity,
            ),
            body_limit_mb: parse(map, "proxy.body_limit_mb", defaults.body_limit_mb),
            buffer_cap_mb: parse(map, "proxy.buffer_cap_mb", defaults.buffer_cap_mb),
            usage_ring_capacity: parse(map, "usage.ring_capacity", defaults.usage_ring_capacity),
            usage_batch_size: parse(map, "usage.batch_size", defaults.usage_batch_size),
            usage_flush_interval_ms: parse(
                map,
                "usage.flush_interval_ms",
                defaults.usage_flush_interval_ms,
            ),
            usage_shutdown_grace_secs: parse(
                map,
                "usage.shutdown_grace_secs",
                defaults.usage_shutdown_grace_secs,
            ),
            admin_email: map.get("admin.email").cloned(),
            admin_password_hash: map.get("admin.password_hash").cloned(),
            admin_jwt_secret: map.get("admin.jwt_secret").cloned(),
            admin_jwt_ttl_secs: parse(map, "admin.jwt_ttl_secs", defaults.admin_jwt_ttl_secs),
            tls: TlsSettings {
                mode: tls_mode,
                cert_path: map.get("tls.cert_path").cloned(),
                key_path: map.get("tls.key_path").cloned(),
                domains: map
                    .get("tls.domains")
                    .map(|d| {
                        d.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
            },
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            enabled: self.rate_limit_enabled,
            burst: self.rate_limit_burst,
        }
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            ring_capacity: self.usage_ring_capacity,
            batch_size: self.usage_batch_size,
            flush_interval: Duration::from_millis(self.usage_flush_interval_ms.max(10)),
            shutdown_grace: Duration::from_secs(self.usage_shutdown_grace_secs),
        }
    }
}

// ─── Settings holder ───────────────────────────────────────────────────────

/// Atomic publication point for [`RuntimeSettings`] plus a version channel
/// subscribers use to react to reloads.
pub struct SettingsHolder {
    current: ArcSwap<RuntimeSettings>,
    version_tx: watch::Sender<u64>,
}

impl SettingsHolder {
    pub fn new(initial: RuntimeSettings) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(initial),
            version_tx,
        }
    }

    pub fn load(&self) -> Arc<RuntimeSettings> {
        self.current.load_full()
    }

    /// Publish a new snapshot and notify subscribers.
    pub fn publish(&self, settings: RuntimeSettings) {
        self.current.store(Arc::new(settings));
        self.version_tx.send_modify(|v| *v += 1);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Re-read the settings namespace from the store and publish it.
    pub async fn reload_from(
        &self,
        store: &dyn SettingsStore,
    ) -> Result<Arc<RuntimeSettings>, StoreError> {
        let map = store.all_settings().await?;
        self.publish(RuntimeSettings::from_map(&map));
        Ok(self.load())
    }
}

// ─── Seed file (legacy config channel) ─────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedUser {
    pub id: String,
    pub email: String,
    pub plan_id: String,
    /// Clear-text admin password, hashed on import.
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedKey {
    pub id: String,
    pub user_id: String,
    /// Raw key material; only the prefix and hash are persisted.
    pub key: String,
    pub name: String,
}

/// Declarative bootstrap for an empty store. Applied create-if-absent;
/// the store remains the source of truth afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedFile {
    pub settings: HashMap<String, String>,
    pub plans: Vec<Plan>,
    pub upstreams: Vec<Upstream>,
    pub routes: Vec<Route>,
    pub users: Vec<SeedUser>,
    pub keys: Vec<SeedKey>,
}

impl SeedFile {
    pub fn load(path: &str) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let seed: SeedFile = serde_yaml_ng::from_str(&contents)?;
        Ok(seed)
    }
}

/// Watch the seed file and hand parsed contents to `on_change` (debounced
/// 150 ms, SHA-256 dedup). The callback applies the seed through the
/// store and triggers snapshot republication.
pub struct SeedWatcher {
    _watcher: notify::RecommendedWatcher,
}

impl SeedWatcher {
    pub fn start(
        path: String,
        on_change: impl Fn(SeedFile) + Send + Sync + 'static,
    ) -> Result<Self, anyhow::Error> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(16);

        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
            if let Ok(event) = res
                && (event.kind.is_modify() || event.kind.is_create())
            {
                let _ = tx.blocking_send(());
            }
        })?;
        watcher.watch(Path::new(&path), RecursiveMode::NonRecursive)?;

        tokio::spawn(async move {
            let mut last_hash: Option<[u8; 32]> = None;
            let mut debounce: Option<tokio::time::Instant> = None;

            loop {
                tokio::select! {
                    Some(()) = rx.recv() => {
                        debounce = Some(tokio::time::Instant::now() + Duration::from_millis(150));
                    }
                    _ = async {
                        match debounce {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        debounce = None;
                        let contents = match std::fs::read(&path) {
                            Ok(contents) => contents,
                            Err(e) => {
                                tracing::error!(path = %path, error = %e, "seed file read failed");
                                continue;
                            }
                        };
                        let hash: [u8; 32] = sha2::Sha256::digest(&contents).into();
                        if last_hash.as_ref() == Some(&hash) {
                            continue;
                        }
                        last_hash = Some(hash);

                        match SeedFile::load(&path) {
                            Ok(seed) => {
                                tracing::info!(path = %path, "seed file changed, reapplying");
                                on_change(seed);
                            }
                            Err(e) => {
                                tracing::error!(path = %path, error = %e, "seed file reload failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}
