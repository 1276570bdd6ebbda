//! CLI argument parsing with subcommand architecture.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tollgate", version, about = "API monetisation gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway (default when no subcommand is given)
    Run(RunArgs),
    /// Stop a running daemon
    Stop(PidArgs),
    /// Check status of a running daemon
    Status(PidArgs),
    /// Send SIGHUP to reload settings and snapshots
    Reload(PidArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Store DSN; only the embedded `memory:` backend ships here
    #[arg(long, default_value = "memory:", env = "TOLLGATE_STORE_DSN")]
    pub store_dsn: String,

    /// Listen host
    #[arg(long, default_value = "0.0.0.0", env = "TOLLGATE_HOST")]
    pub host: String,

    /// Listen port
    #[arg(short, long, default_value = "8787", env = "TOLLGATE_PORT")]
    pub port: u16,

    /// Log level
    #[arg(long, default_value = "info", env = "TOLLGATE_LOG_LEVEL")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "TOLLGATE_LOG_JSON")]
    pub log_json: bool,

    /// Write logs to rotating files instead of stderr
    #[arg(long, env = "TOLLGATE_LOG_TO_FILE")]
    pub log_to_file: bool,

    /// Log directory (with --log-to-file)
    #[arg(long, env = "TOLLGATE_LOG_DIR")]
    pub log_dir: Option<String>,

    /// YAML seed file imported into the store at boot and watched for
    /// changes; the store stays authoritative
    #[arg(long, env = "TOLLGATE_SEED")]
    pub seed: Option<String>,

    /// Run as a background daemon (unix only)
    #[arg(long)]
    pub daemon: bool,

    /// Path to PID file
    #[arg(long, default_value = "./tollgate.pid")]
    pub pid_file: String,

    /// Graceful shutdown timeout in seconds
    #[arg(long, default_value = "10")]
    pub shutdown_timeout: u64,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            store_dsn: "memory:".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8787,
            log_level: "info".to_string(),
            log_json: false,
            log_to_file: false,
            log_dir: None,
            seed: None,
            daemon: false,
            pid_file: "./tollgate.pid".to_string(),
            shutdown_timeout: 10,
        }
    }
}

#[derive(Parser, Debug)]
pub struct PidArgs {
    /// Path to PID file
    #[arg(long, default_value = "./tollgate.pid")]
    pub pid_file: String,

    /// Timeout in seconds for the stop operation
    #[arg(long, default_value = "30")]
    pub timeout: u64,
}
