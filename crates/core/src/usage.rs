//! Write-behind usage metering.
//!
//! Request tasks push events into a bounded in-memory ring and return
//! immediately; a single background flusher batches events into the
//! events store and rolls them up into per-user monthly aggregates. When
//! the ring is full the oldest undrained event is overwritten and a
//! counter is incremented — the request path is never blocked.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::meter::{MeterExpr, MeterStats};
use crate::metrics::Metrics;
use crate::model::{UsageDelta, UsageEvent, period_for};
use crate::store::UsageStore;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub ring_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 8192,
            batch_size: 256,
            flush_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Fire-and-forget sink for usage events.
pub struct UsageRecorder {
    ring: Mutex<VecDeque<UsageEvent>>,
    capacity: usize,
    batch_size: usize,
    dropped: AtomicU64,
    wakeup: Notify,
    metrics: Arc<Metrics>,
}

impl UsageRecorder {
    pub fn new(config: &RecorderConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(config.ring_capacity)),
            capacity: config.ring_capacity.max(1),
            batch_size: config.batch_size.max(1),
            dropped: AtomicU64::new(0),
            wakeup: Notify::new(),
            metrics,
        }
    }

    /// Enqueue an event. Overwrites the oldest entry when full.
    pub fn record(&self, event: UsageEvent) {
        let wake = {
            let mut ring = match self.ring.lock() {
                Ok(ring) => ring,
                Err(poisoned) => poisoned.into_inner(),
            };
            if ring.len() >= self.capacity {
                ring.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_dropped_usage_event();
            }
            ring.push_back(event);
            ring.len() >= self.batch_size
        };
        if wake {
            self.wakeup.notify_one();
        }
    }

    pub fn pending(&self) -> usize {
        self.ring.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn drain(&self, max: usize) -> Vec<UsageEvent> {
        let mut ring = match self.ring.lock() {
            Ok(ring) => ring,
            Err(poisoned) => poisoned.into_inner(),
        };
        let take = ring.len().min(max);
        ring.drain(..take).collect()
    }
}

/// Background consumer: drains the ring into the store on a tick or when
/// a full batch is waiting.
pub struct UsageFlusher {
    recorder: Arc<UsageRecorder>,
    store: Arc<dyn UsageStore>,
    config: RecorderConfig,
}

impl UsageFlusher {
    pub fn new(
        recorder: Arc<UsageRecorder>,
        store: Arc<dyn UsageStore>,
        config: RecorderConfig,
    ) -> Self {
        Self {
            recorder,
            store,
            config,
        }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.flush_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = self.recorder.wakeup.notified() => {}
                    _ = shutdown.changed() => {
                        if !*shutdown.borrow() {
                            continue;
                        }
                        // Final drain, bounded by the grace period.
                        let drained =
                            tokio::time::timeout(self.config.shutdown_grace, self.flush_all())
                                .await;
                        if drained.is_err() {
                            tracing::warn!(
                                pending = self.recorder.pending(),
                                "usage flusher grace period elapsed with events pending"
                            );
                        }
                        return;
                    }
                }
                self.flush_all().await;
            }
        })
    }

    async fn flush_all(&self) {
        loop {
            let batch = self.recorder.drain(self.config.batch_size);
            if batch.is_empty() {
                return;
            }
            if let Err(e) = self.store.append_events(&batch).await {
                tracing::error!(count = batch.len(), error = %e, "failed to persist usage events");
            }
            for ((user_id, period), delta) in fold_deltas(&batch) {
                if let Err(e) = self
                    .store
                    .increment_aggregate(&user_id, &period, &delta)
                    .await
                {
                    tracing::error!(user_id = %user_id, period = %period, error = %e,
                        "failed to roll up usage aggregate");
                }
            }
        }
    }
}

/// Coalesce a batch into per-(user, month) deltas. Aggregates are sums,
/// so flush order across users does not matter.
fn fold_deltas(events: &[UsageEvent]) -> HashMap<(String, String), UsageDelta> {
    let mut folded: HashMap<(String, String), UsageDelta> = HashMap::new();
    for event in events {
        if event.user_id.is_empty() {
            // Unauthenticated attempts have no aggregate to roll into.
            continue;
        }
        folded
            .entry((event.user_id.clone(), period_for(event.ts)))
            .or_default()
            .merge(&UsageDelta::from_event(event));
    }
    folded
}

/// Usage accounting for streamed responses: bytes are only known once the
/// body has been fully relayed (or the client went away), so the event is
/// emitted when this guard drops.
pub struct DeferredUsage {
    recorder: Arc<UsageRecorder>,
    metrics: Arc<Metrics>,
    meter: MeterExpr,
    event: Option<UsageEvent>,
    started: Instant,
    bytes_in: u64,
    bytes_out: u64,
}

impl DeferredUsage {
    pub fn new(
        recorder: Arc<UsageRecorder>,
        metrics: Arc<Metrics>,
        meter: MeterExpr,
        event: UsageEvent,
        started: Instant,
    ) -> Self {
        Self {
            recorder,
            metrics,
            meter,
            event: Some(event),
            started,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Extra inbound bytes discovered while relaying (WebSocket frames).
    pub fn add_bytes_in(&mut self, n: u64) {
        self.bytes_in += n;
    }

    pub fn add_bytes_out(&mut self, n: u64) {
        self.bytes_out += n;
    }

    pub fn set_error(&mut self, code: &str) {
        if let Some(event) = self.event.as_mut() {
            event.error = Some(code.to_string());
        }
    }
}

impl Drop for DeferredUsage {
    fn drop(&mut self) {
        let Some(mut event) = self.event.take() else {
            return;
        };
        event.bytes_in += self.bytes_in;
        event.bytes_out = self.bytes_out;
        event.latency_ms = self.started.elapsed().as_millis() as u64;
        event.compute_units = self.meter.eval(&MeterStats {
            bytes_in: event.bytes_in,
            bytes_out: event.bytes_out,
            latency_ms: event.latency_ms,
        });
        self.metrics.record_bytes(event.bytes_in, event.bytes_out);
        self.metrics.record_latency_ms(event.latency_ms);
        self.recorder.record(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{UsageAggregate, UsageEvent};
    use crate::store::StoreError;
    use async_trait::async_trait;
    use chrono::Utc;

    fn event(user: &str, status: u16) -> UsageEvent {
        UsageEvent {
            ts: Utc::now(),
            user_id: user.to_string(),
            key_id: "k1".into(),
            route_id: "r1".into(),
            method: "GET".into(),
            path: "/api/data".into(),
            status,
            latency_ms: 12,
            bytes_in: 10,
            bytes_out: 20,
            compute_units: 1.0,
            error: None,
        }
    }

    fn recorder(capacity: usize, batch: usize) -> Arc<UsageRecorder> {
        Arc::new(UsageRecorder::new(
            &RecorderConfig {
                ring_capacity: capacity,
                batch_size: batch,
                ..RecorderConfig::default()
            },
            Arc::new(Metrics::new()),
        ))
    }

    /// Store stub that captures everything the flusher writes.
    #[derive(Default)]
    struct CaptureStore {
        events: Mutex<Vec<UsageEvent>>,
        deltas: Mutex<Vec<(String, String, UsageDelta)>>,
    }

    #[async_trait]
    impl UsageStore for CaptureStore {
        async fn append_events(&self, events: &[UsageEvent]) -> Result<(), StoreError> {
            self.events.lock().unwrap().extend_from_slice(events);
            Ok(())
        }

        async fn increment_aggregate(
            &self,
            user_id: &str,
            period: &str,
            delta: &UsageDelta,
        ) -> Result<(), StoreError> {
            self.deltas.lock().unwrap().push((
                user_id.to_string(),
                period.to_string(),
                delta.clone(),
            ));
            Ok(())
        }

        async fn get_aggregate(
            &self,
            _user_id: &str,
            _period: &str,
        ) -> Result<Option<UsageAggregate>, StoreError> {
            Ok(None)
        }

        async fn summary(&self, _period: &str) -> Result<Vec<UsageAggregate>, StoreError> {
            Ok(vec![])
        }

        async fn history(
            &self,
            _user_id: &str,
            _limit: usize,
        ) -> Result<Vec<UsageAggregate>, StoreError> {
            Ok(vec![])
        }

        async fn recent_events(&self, _limit: usize) -> Result<Vec<UsageEvent>, StoreError> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_ring_overwrites_oldest_when_full() {
        let rec = recorder(3, 100);
        for i in 0..5 {
            rec.record(event(&format!("u{i}"), 200));
        }
        assert_eq!(rec.pending(), 3);
        assert_eq!(rec.dropped_count(), 2);

        let remaining = rec.drain(10);
        let users: Vec<&str> = remaining.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(users, vec!["u2", "u3", "u4"]);
    }

    #[test]
    fn test_fold_groups_by_user_and_period() {
        let mut failed = event("u1", 500);
        failed.error = Some("upstream_unavailable".into());
        let batch = vec![event("u1", 200), failed, event("u2", 200)];

        let folded = fold_deltas(&batch);
        assert_eq!(folded.len(), 2);
        let u1 = &folded[&("u1".to_string(), period_for(Utc::now()))];
        assert_eq!(u1.requests, 2);
        assert_eq!(u1.errors, 1);
        assert_eq!(u1.bytes_out, 40);
    }

    #[test]
    fn test_fold_skips_anonymous_events() {
        let mut anonymous = event("", 401);
        anonymous.error = Some("invalid_api_key".into());
        assert!(fold_deltas(&[anonymous]).is_empty());
    }

    #[tokio::test]
    async fn test_flusher_persists_batches() {
        let rec = recorder(100, 2);
        let store = Arc::new(CaptureStore::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let flusher = UsageFlusher::new(
            Arc::clone(&rec),
            store.clone(),
            RecorderConfig {
                ring_capacity: 100,
                batch_size: 2,
                flush_interval: Duration::from_millis(10),
                shutdown_grace: Duration::from_secs(1),
            },
        );
        let handle = flusher.spawn(shutdown_rx);

        rec.record(event("u1", 200));
        rec.record(event("u1", 200));
        rec.record(event("u2", 200));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.events.lock().unwrap().len(), 3);
        assert_eq!(rec.pending(), 0);

        let deltas = store.deltas.lock().unwrap();
        let u1_total: u64 = deltas
            .iter()
            .filter(|(u, _, _)| u == "u1")
            .map(|(_, _, d)| d.requests)
            .sum();
        assert_eq!(u1_total, 2);
        drop(deltas);

        let _ = shutdown_tx.send(true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_residual_events() {
        let rec = recorder(100, 64);
        let store = Arc::new(CaptureStore::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let flusher = UsageFlusher::new(
            Arc::clone(&rec),
            store.clone(),
            RecorderConfig {
                ring_capacity: 100,
                batch_size: 64,
                // Long interval: only the shutdown drain can flush these.
                flush_interval: Duration::from_secs(3600),
                shutdown_grace: Duration::from_secs(1),
            },
        );
        let handle = flusher.spawn(shutdown_rx);
        // Let the flusher pass its first (immediate) tick before recording.
        tokio::time::sleep(Duration::from_millis(20)).await;

        rec.record(event("u1", 200));
        rec.record(event("u2", 200));
        let _ = shutdown_tx.send(true);
        handle.await.unwrap();

        assert_eq!(store.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_deferred_usage_records_on_drop() {
        let rec = recorder(10, 100);
        let metrics = Arc::new(Metrics::new());
        let meter = MeterExpr::compile("requests + bytes_out / 10").unwrap();

        {
            let mut deferred = DeferredUsage::new(
                Arc::clone(&rec),
                metrics,
                meter,
                event("u1", 200),
                Instant::now(),
            );
            deferred.add_bytes_out(30);
            deferred.add_bytes_out(20);
        }

        let drained = rec.drain(10);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].bytes_out, 50);
        assert!((drained[0].compute_units - 6.0).abs() < 1e-9);
    }
}
