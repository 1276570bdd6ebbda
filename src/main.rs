mod app;
mod cli;

use clap::Parser;
use cli::{Cli, Command, RunArgs};

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Command::Run(RunArgs::default()));

    match command {
        Command::Run(args) => cmd_run(args),
        Command::Stop(args) => cmd_stop(args),
        Command::Status(args) => cmd_status(args),
        Command::Reload(args) => cmd_reload(args),
    }
}

fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    // Daemonize before creating the tokio runtime (unix only)
    #[cfg(unix)]
    if args.daemon {
        tollgate_core::lifecycle::process::daemonize()?;
    }

    // Daemons always log to files; stderr is gone after the fork.
    let to_file = args.daemon || args.log_to_file;
    let _guard = tollgate_core::lifecycle::logging::init_logging(
        &args.log_level,
        args.log_json,
        to_file,
        args.log_dir.as_deref(),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let application = app::Application::build(&args).await?;
        application.serve().await
    })
}

#[cfg(unix)]
fn cmd_stop(args: cli::PidArgs) -> anyhow::Result<()> {
    use tollgate_core::lifecycle::process;

    let pid = process::read_pid(&args.pid_file)?;
    if !process::process_alive(pid) {
        println!("Process {pid} is not running.");
        return Ok(());
    }

    println!("Stopping PID {pid} (timeout {}s)...", args.timeout);
    process::stop(pid, std::time::Duration::from_secs(args.timeout))?;
    println!("Stopped.");
    Ok(())
}

#[cfg(not(unix))]
fn cmd_stop(_args: cli::PidArgs) -> anyhow::Result<()> {
    anyhow::bail!("the 'stop' command is only supported on Unix systems");
}

#[cfg(unix)]
fn cmd_status(args: cli::PidArgs) -> anyhow::Result<()> {
    use tollgate_core::lifecycle::process;

    match process::read_pid(&args.pid_file) {
        Ok(pid) => {
            if process::process_alive(pid) {
                println!("tollgate is running (PID {pid})");
            } else {
                println!("tollgate is NOT running (stale PID file, PID {pid})");
            }
        }
        Err(_) => {
            println!("tollgate is NOT running (no PID file at {})", args.pid_file);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn cmd_status(_args: cli::PidArgs) -> anyhow::Result<()> {
    anyhow::bail!("the 'status' command is only supported on Unix systems");
}

#[cfg(unix)]
fn cmd_reload(args: cli::PidArgs) -> anyhow::Result<()> {
    use tollgate_core::lifecycle::process;

    let pid = process::read_pid(&args.pid_file)?;
    if !process::process_alive(pid) {
        anyhow::bail!("process {pid} is not running");
    }

    process::send_signal(pid, libc::SIGHUP)?;
    println!("Sent SIGHUP to PID {pid}");
    Ok(())
}

#[cfg(not(unix))]
fn cmd_reload(_args: cli::PidArgs) -> anyhow::Result<()> {
    anyhow::bail!("the 'reload' command is only supported on Unix systems");
}
