//! Process plumbing: daemonization, PID-file ownership, and the signal
//! listener that drives reload and shutdown.

use tokio::sync::watch;

#[cfg(unix)]
pub use unix::{PidGuard, daemonize, process_alive, read_pid, send_signal, stop};

/// Install the signal listener. SIGHUP invokes `reload`; SIGTERM and
/// ctrl-c flip the returned shutdown flag. Reload handling runs in its
/// own task, so a slow reload can never delay shutdown delivery.
pub fn spawn_signal_listener<F>(reload: F) -> watch::Receiver<bool>
where
    F: Fn() + Send + Sync + 'static,
{
    let (tx, rx) = watch::channel(false);

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::hangup()) {
            Ok(mut hangup) => {
                while hangup.recv().await.is_some() {
                    tracing::info!("SIGHUP received, reloading...");
                    reload();
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGHUP handler"),
        }
    });
    #[cfg(not(unix))]
    let _ = reload;

    tokio::spawn(async move {
        shutdown_requested().await;
        let _ = tx.send(true);
    });

    rx
}

/// Resolves once a termination signal arrives.
async fn shutdown_requested() {
    let interrupt = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                let _ = interrupt.await;
                return;
            }
        };
        tokio::select! {
            _ = interrupt => tracing::info!("interrupt received, shutting down..."),
            _ = terminate.recv() => tracing::info!("SIGTERM received, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
        tracing::info!("ctrl-c received, shutting down...");
    }
}

#[cfg(unix)]
mod unix {
    use std::fs::{self, File, OpenOptions};
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant};

    /// Detach from the terminal. The working directory is kept so
    /// relative store and seed paths stay valid; stdio moves to
    /// `/dev/null`. Must run before the async runtime exists.
    pub fn daemonize() -> anyhow::Result<()> {
        match fork::daemon(true, false).map_err(|code| anyhow::anyhow!("fork failed ({code})"))? {
            fork::Fork::Parent(_) => std::process::exit(0),
            fork::Fork::Child => Ok(()),
        }
    }

    /// Exclusive ownership of a PID file.
    ///
    /// The file is locked before it is truncated, so a probing or racing
    /// instance can never wipe the PID of a live gateway. The advisory
    /// lock rides on the open handle; dropping the guard unlinks the
    /// file and then releases the lock with the handle.
    pub struct PidGuard {
        path: PathBuf,
        _file: File,
    }

    impl PidGuard {
        pub fn acquire(path: impl AsRef<Path>) -> anyhow::Result<Self> {
            let path = path.as_ref().to_path_buf();
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;

            let locked =
                unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0;
            if !locked {
                anyhow::bail!(
                    "PID file {} is held by another instance ({})",
                    path.display(),
                    std::io::Error::last_os_error()
                );
            }

            file.set_len(0)?;
            writeln!(&file, "{}", std::process::id())?;

            Ok(Self { path, _file: file })
        }
    }

    impl Drop for PidGuard {
        fn drop(&mut self) {
            // Unlink while the lock is still held; the handle (and with
            // it the lock) goes away right after.
            let _ = fs::remove_file(&self.path);
        }
    }

    /// PID recorded in a PID file.
    pub fn read_pid(path: impl AsRef<Path>) -> anyhow::Result<u32> {
        let text = fs::read_to_string(path.as_ref())?;
        text.trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("PID file does not contain a PID: {e}"))
    }

    /// Whether `pid` names a live process (signal-0 probe).
    pub fn process_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    pub fn send_signal(pid: u32, sig: i32) -> anyhow::Result<()> {
        match unsafe { libc::kill(pid as libc::pid_t, sig) } {
            0 => Ok(()),
            _ => anyhow::bail!("kill({pid}, {sig}): {}", std::io::Error::last_os_error()),
        }
    }

    /// SIGTERM with a deadline, escalating to SIGKILL.
    pub fn stop(pid: u32, timeout: Duration) -> anyhow::Result<()> {
        if send_signal(pid, libc::SIGTERM).is_err() {
            // Already gone.
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        while process_alive(pid) {
            if Instant::now() >= deadline {
                tracing::warn!(pid, "graceful stop timed out, sending SIGKILL");
                send_signal(pid, libc::SIGKILL)?;
                std::thread::sleep(Duration::from_millis(200));
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn pid_guard_owns_and_releases_the_file() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("gw.pid");

            let guard = PidGuard::acquire(&path).unwrap();
            assert_eq!(read_pid(&path).unwrap(), std::process::id());
            // A second instance must be refused while the guard lives.
            assert!(PidGuard::acquire(&path).is_err());

            drop(guard);
            assert!(read_pid(&path).is_err(), "file should be unlinked on drop");
            // The path is free to claim again.
            let _reacquired = PidGuard::acquire(&path).unwrap();
        }

        #[test]
        fn read_pid_rejects_garbage() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("bad.pid");
            fs::write(&path, "not-a-pid\n").unwrap();
            assert!(read_pid(&path).is_err());
        }

        #[test]
        fn liveness_probe() {
            assert!(process_alive(std::process::id()));
            assert!(!process_alive(u32::MAX - 1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_starts_with_shutdown_unset() {
        let rx = spawn_signal_listener(|| {});
        assert!(!*rx.borrow());
    }
}
