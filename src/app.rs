//! Application assembly and serving.
//!
//! Startup order: store open → seed import → settings snapshot → usage
//! recorder → route snapshot → listener. Teardown runs in reverse:
//! connections drain under the shutdown timeout, then the recorder
//! drains under its grace period.

use crate::cli::RunArgs;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use tollgate_core::config::{RuntimeSettings, SeedFile, SeedWatcher, SettingsHolder, TlsMode};
use tollgate_core::keys;
use tollgate_core::lifecycle::{self, Lifecycle};
use tollgate_core::metrics::Metrics;
use tollgate_core::model::{ApiKey, User, UserStatus};
use tollgate_core::quota::QuotaGate;
use tollgate_core::rate_limit::RateLimiter;
use tollgate_core::store::{Store, StoreError, TlsCacheStore, UsageStore};
use tollgate_core::usage::{UsageFlusher, UsageRecorder};
use tollgate_proxy::router::Router;
use tollgate_proxy::transport::UpstreamPool;
use tollgate_server::auth::KeyValidator;
use tollgate_server::tls::{StoreCertResolver, acme_server_config, manual_server_config};
use tollgate_server::{AppState, build_router};
use tollgate_store::MemStore;

pub struct Application {
    state: AppState,
    app_router: axum::Router,
    recorder_shutdown: watch::Sender<bool>,
    flusher: tokio::task::JoinHandle<()>,
    lifecycle: Box<dyn Lifecycle>,
    seed_path: Option<String>,
    bind_addr: String,
    /// Bound on the connection drain once shutdown is signalled.
    drain_timeout: Duration,
    #[cfg(unix)]
    _pid_file: Option<tollgate_core::lifecycle::process::PidGuard>,
}

impl Application {
    /// Open the store, import the seed, publish the initial snapshots,
    /// and start the background tasks.
    pub async fn build(args: &RunArgs) -> anyhow::Result<Self> {
        let store: Arc<dyn Store> = match args.store_dsn.as_str() {
            "memory:" | "memory" => Arc::new(MemStore::new()),
            other => anyhow::bail!(
                "unsupported store DSN {other:?}; this build ships the embedded 'memory:' backend"
            ),
        };

        #[cfg(unix)]
        let _pid_file = if args.daemon {
            Some(tollgate_core::lifecycle::process::PidGuard::acquire(
                &args.pid_file,
            )?)
        } else {
            None
        };

        if let Some(path) = &args.seed {
            let seed = SeedFile::load(path)?;
            apply_seed(&*store, &seed).await?;
            tracing::info!(
                path = %path,
                plans = seed.plans.len(),
                routes = seed.routes.len(),
                users = seed.users.len(),
                "seed file imported"
            );
        }

        let settings_holder = Arc::new(SettingsHolder::new(RuntimeSettings::default()));
        let settings = settings_holder.reload_from(&*store).await?;

        let metrics = Arc::new(Metrics::new());
        let recorder = Arc::new(UsageRecorder::new(
            &settings.recorder_config(),
            Arc::clone(&metrics),
        ));
        let (recorder_shutdown, recorder_rx) = watch::channel(false);
        let store_clone: Arc<dyn Store> = Arc::clone(&store);
        let usage_store: Arc<dyn UsageStore> = store_clone;
        let flusher = UsageFlusher::new(
            Arc::clone(&recorder),
            usage_store,
            settings.recorder_config(),
        )
        .spawn(recorder_rx);

        let state = AppState {
            store: Arc::clone(&store),
            settings: Arc::clone(&settings_holder),
            router: Arc::new(Router::new()),
            upstreams: Arc::new(UpstreamPool::new()),
            validator: Arc::new(KeyValidator::new(&settings)),
            rate_limiter: Arc::new(RateLimiter::new(settings.rate_limit_config())),
            quota: Arc::new(QuotaGate::new()),
            recorder,
            metrics,
            start_time: Instant::now(),
        };
        state.reload_routes().await?;

        // Rebuild the route snapshot whenever the store signals a change.
        let mut route_rx = store.watch_routes();
        let route_state = state.clone();
        tokio::spawn(async move {
            while route_rx.changed().await.is_ok() {
                if let Err(e) = route_state.reload_routes().await {
                    tracing::error!(
                        error = %e,
                        "route snapshot rebuild failed; previous snapshot retained"
                    );
                }
            }
        });

        // Evict idle token buckets in the background.
        let janitor = Arc::clone(&state.rate_limiter);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                janitor.evict_idle(Instant::now());
            }
        });

        let app_router = build_router(state.clone());

        Ok(Self {
            state,
            app_router,
            recorder_shutdown,
            flusher,
            lifecycle: lifecycle::detect_lifecycle(),
            seed_path: args.seed.clone(),
            bind_addr: format!("{}:{}", args.host, args.port),
            drain_timeout: Duration::from_secs(args.shutdown_timeout),
            #[cfg(unix)]
            _pid_file,
        })
    }

    /// Serve until a shutdown signal, then drain connections (bounded by
    /// `--shutdown-timeout`) and the usage recorder.
    pub async fn serve(self) -> anyhow::Result<()> {
        let Self {
            state,
            app_router,
            recorder_shutdown,
            flusher,
            lifecycle,
            seed_path,
            bind_addr,
            drain_timeout,
            #[cfg(unix)]
            _pid_file,
        } = self;

        // Watch the legacy seed file; changes flow through the store.
        let _seed_watcher = match &seed_path {
            Some(path) => {
                let seed_state = state.clone();
                Some(SeedWatcher::start(path.clone(), move |seed| {
                    let seed_state = seed_state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = apply_seed(&*seed_state.store, &seed).await {
                            tracing::error!(error = %e, "seed reapply failed");
                            return;
                        }
                        if let Err(e) = seed_state.reload_settings().await {
                            tracing::error!(error = %e, "settings reload failed");
                        }
                        if let Err(e) = seed_state.reload_routes().await {
                            tracing::error!(
                                error = %e,
                                "route snapshot rebuild failed; previous snapshot retained"
                            );
                        }
                    });
                })?)
            }
            None => None,
        };

        // SIGHUP → settings + snapshot reload.
        let reload_state = state.clone();
        let reload_lifecycle: Arc<dyn Lifecycle> = Arc::from(lifecycle::detect_lifecycle());
        let shutdown_rx = lifecycle::process::spawn_signal_listener(move || {
            let reload_state = reload_state.clone();
            let reload_lifecycle = Arc::clone(&reload_lifecycle);
            tokio::spawn(async move {
                reload_lifecycle.on_reloading();
                if let Err(e) = reload_state.reload_settings().await {
                    tracing::error!(error = %e, "SIGHUP settings reload failed");
                }
                match reload_state.reload_routes().await {
                    Ok(()) => reload_lifecycle.on_reloaded(),
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            "SIGHUP route rebuild failed; previous snapshot retained"
                        );
                    }
                }
            });
        });

        // TLS mode is a binding decision: read once at startup.
        let settings = state.settings.load();
        match settings.tls.mode {
            TlsMode::None => {
                serve_http(&bind_addr, app_router, shutdown_rx, &*lifecycle, drain_timeout)
                    .await?;
            }
            TlsMode::Manual => {
                let (Some(cert), Some(key)) = (&settings.tls.cert_path, &settings.tls.key_path)
                else {
                    anyhow::bail!("tls.mode=manual requires tls.cert_path and tls.key_path");
                };
                let config = manual_server_config(cert, key)?;
                serve_tls(
                    &bind_addr,
                    config,
                    app_router,
                    shutdown_rx,
                    &*lifecycle,
                    drain_timeout,
                )
                .await?;
            }
            TlsMode::Acme => {
                let resolver = Arc::new(StoreCertResolver::new());
                let tls_store: &dyn TlsCacheStore = &*state.store;
                let loaded = resolver.refresh(tls_store, &settings.tls.domains).await?;
                tracing::info!(domains = loaded, "TLS certificates loaded from store cache");
                let config = acme_server_config(resolver);
                serve_tls(
                    &bind_addr,
                    config,
                    app_router,
                    shutdown_rx,
                    &*lifecycle,
                    drain_timeout,
                )
                .await?;
            }
        }

        // Drain buffered usage events before releasing the process.
        let grace = state.settings.load().usage_shutdown_grace_secs;
        let _ = recorder_shutdown.send(true);
        if tokio::time::timeout(Duration::from_secs(grace + 1), flusher)
            .await
            .is_err()
        {
            tracing::warn!("usage flusher did not drain within the grace period");
        }

        tracing::info!("gateway shut down");
        Ok(())
    }
}

async fn serve_http(
    addr: &str,
    app_router: axum::Router,
    shutdown_rx: watch::Receiver<bool>,
    lifecycle: &dyn Lifecycle,
    drain_timeout: Duration,
) -> anyhow::Result<()> {
    tracing::info!(addr = %addr, "starting HTTP listener");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    lifecycle.on_ready();

    let mut trigger = shutdown_rx.clone();
    let graceful = async move {
        let _ = trigger.wait_for(|stop| *stop).await;
    };

    let server = axum::serve(listener, app_router)
        .with_graceful_shutdown(graceful)
        .into_future();
    tokio::pin!(server);

    // Give in-flight requests `drain_timeout` after the shutdown signal,
    // then abandon whatever is still open.
    let mut deadline_rx = shutdown_rx;
    tokio::select! {
        result = &mut server => result?,
        _ = async {
            let _ = deadline_rx.wait_for(|stop| *stop).await;
            tokio::time::sleep(drain_timeout).await;
        } => {
            tracing::warn!(
                secs = drain_timeout.as_secs(),
                "drain deadline reached, aborting open connections"
            );
        }
    }

    lifecycle.on_stopping();
    Ok(())
}

async fn serve_tls(
    addr: &str,
    tls_config: rustls::ServerConfig,
    app_router: axum::Router,
    mut shutdown_rx: watch::Receiver<bool>,
    lifecycle: &dyn Lifecycle,
    drain_timeout: Duration,
) -> anyhow::Result<()> {
    let tls_acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

    tracing::info!(addr = %addr, "starting HTTPS listener");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    lifecycle.on_ready();

    let mut connections = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                let acceptor = tls_acceptor.clone();
                let router = app_router.clone();
                connections.spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let io = hyper_util::rt::TokioIo::new(tls_stream);
                            let service = hyper::service::service_fn(
                                move |req: hyper::Request<hyper::body::Incoming>| {
                                    let router = router.clone();
                                    async move {
                                        let (parts, body) = req.into_parts();
                                        let body = axum::body::Body::new(body);
                                        let req = axum::http::Request::from_parts(parts, body);
                                        Ok::<_, std::convert::Infallible>(
                                            tower::ServiceExt::oneshot(router, req)
                                                .await
                                                .expect("infallible"),
                                        )
                                    }
                                },
                            );
                            if let Err(e) = hyper_util::server::conn::auto::Builder::new(
                                hyper_util::rt::TokioExecutor::new(),
                            )
                            .serve_connection_with_upgrades(io, service)
                            .await
                            {
                                tracing::debug!(peer = %peer_addr, error = %e, "TLS connection error");
                            }
                        }
                        Err(e) => tracing::debug!(peer = %peer_addr, error = %e, "TLS accept error"),
                    }
                });
            }
            // Reap finished connection tasks as we go.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                tracing::info!("stopping TLS listener, draining connections...");
                break;
            }
        }
    }

    lifecycle.on_stopping();

    // Bounded drain: wait up to `drain_timeout` for open connections,
    // then abort the stragglers.
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!(
            open = connections.len(),
            secs = drain_timeout.as_secs(),
            "drain deadline reached, aborting open TLS connections"
        );
        connections.abort_all();
    }

    Ok(())
}

/// Import a seed file. Settings, plans, routes, and upstreams are
/// upserted; users and keys are created only when absent so runtime
/// mutations survive a reapply. The store stays the source of truth.
async fn apply_seed(store: &dyn Store, seed: &SeedFile) -> anyhow::Result<()> {
    for (key, value) in &seed.settings {
        store.set_setting(key, value, false).await?;
    }
    let seeded_settings = RuntimeSettings::from_map(&seed.settings);

    for plan in &seed.plans {
        upsert(store.update_plan(plan.clone()).await, || {
            store.create_plan(plan.clone())
        })
        .await?;
    }
    for upstream in &seed.upstreams {
        upsert(store.update_upstream(upstream.clone()).await, || {
            store.create_upstream(upstream.clone())
        })
        .await?;
    }
    for route in &seed.routes {
        upsert(store.update_route(route.clone()).await, || {
            store.create_route(route.clone())
        })
        .await?;
    }

    for user in &seed.users {
        if store.get_user(&user.id).await.is_ok() {
            continue;
        }
        let password_hash = match &user.password {
            Some(password) => Some(bcrypt::hash(password, seeded_settings.bcrypt_cost)?),
            None => None,
        };
        store
            .create_user(User {
                id: user.id.clone(),
                email: user.email.clone(),
                plan_id: user.plan_id.clone(),
                status: UserStatus::Active,
                password_hash,
                created_at: chrono::Utc::now(),
            })
            .await?;
    }

    for key in &seed.keys {
        if store.get_key(&key.id).await.is_ok() {
            continue;
        }
        let Some(prefix) = keys::parse(&key.key, &seeded_settings.key_scheme) else {
            tracing::warn!(key_id = %key.id, "seed key is malformed, skipping");
            continue;
        };
        let prefix = prefix.to_string();
        let key_hash = keys::hash_key(&key.key, seeded_settings.bcrypt_cost)?;
        store
            .create_key(ApiKey {
                id: key.id.clone(),
                user_id: key.user_id.clone(),
                prefix,
                key_hash,
                name: key.name.clone(),
                expires_at: None,
                revoked_at: None,
                created_at: chrono::Utc::now(),
            })
            .await?;
    }

    Ok(())
}

async fn upsert<F, Fut>(updated: Result<(), StoreError>, create: F) -> Result<(), StoreError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    match updated {
        Ok(()) => Ok(()),
        Err(StoreError::NotFound(_)) => create().await,
        Err(e) => Err(e),
    }
}
