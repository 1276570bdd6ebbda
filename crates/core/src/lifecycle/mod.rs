//! Process lifecycle: readiness notification, signal handling,
//! daemonization, PID files, and logging setup.

pub mod logging;
pub mod process;

/// Lifecycle event notification (foreground vs systemd).
pub trait Lifecycle: Send + Sync {
    /// The listener is bound and accepting connections.
    fn on_ready(&self);
    /// A settings/snapshot reload is starting.
    fn on_reloading(&self);
    /// The reload finished.
    fn on_reloaded(&self);
    /// Shutdown has begun; connections are draining.
    fn on_stopping(&self);
}

/// Foreground lifecycle — logs events only.
pub struct ForegroundLifecycle;

impl Lifecycle for ForegroundLifecycle {
    fn on_ready(&self) {
        tracing::info!("gateway ready");
    }

    fn on_reloading(&self) {
        tracing::info!("gateway reloading...");
    }

    fn on_reloaded(&self) {
        tracing::info!("gateway reloaded");
    }

    fn on_stopping(&self) {
        tracing::info!("gateway stopping...");
    }
}

/// Systemd lifecycle — mirrors events over sd-notify.
pub struct SystemdLifecycle;

impl Lifecycle for SystemdLifecycle {
    fn on_ready(&self) {
        let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
        tracing::info!("gateway ready (systemd notified)");
    }

    fn on_reloading(&self) {
        let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Reloading]);
        tracing::info!("gateway reloading (systemd notified)...");
    }

    fn on_reloaded(&self) {
        let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
        tracing::info!("gateway reloaded (systemd notified)");
    }

    fn on_stopping(&self) {
        let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
        tracing::info!("gateway stopping (systemd notified)...");
    }
}

/// Pick the lifecycle implementation from the environment:
/// `SystemdLifecycle` when `NOTIFY_SOCKET` is set, else foreground.
pub fn detect_lifecycle() -> Box<dyn Lifecycle> {
    if std::env::var_os("NOTIFY_SOCKET").is_some() {
        Box::new(SystemdLifecycle)
    } else {
        Box::new(ForegroundLifecycle)
    }
}
