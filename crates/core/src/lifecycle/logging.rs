//! Tracing subscriber setup with optional rotating file output.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Initialize logging.
///
/// - `to_file=true` → daily-rotated file under `log_dir` with a
///   non-blocking writer; the returned guard must live as long as the
///   process so buffered lines flush on shutdown.
/// - `json=true` → structured JSON lines instead of the human format.
pub fn init_logging(
    level: &str,
    json: bool,
    to_file: bool,
    log_dir: Option<&str>,
) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if to_file {
        let dir = log_dir.unwrap_or("./logs");
        let file_appender = tracing_appender::rolling::daily(dir, "tollgate.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let builder = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .with_ansi(false);
        if json {
            builder.json().init();
        } else {
            builder.init();
        }
        Some(guard)
    } else {
        let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
        if json {
            builder.json().init();
        } else {
            builder.init();
        }
        None
    }
}
