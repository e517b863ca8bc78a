//! dockhand: run a containerized workload inside a supervised Linux VM.
//!
//! `dockhand run` boots the guest, forwards the workload's ports to
//! `127.0.0.1`, and keeps it healthy until Ctrl-C. `SIGUSR1`/`SIGUSR2` stand
//! in for host sleep/wake notifications.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use dockhand::config::DockhandConfig;
use dockhand::error::SupervisorError;
use dockhand::paths::DockhandPaths;
use dockhand::vm::lifecycle::SupervisorEvent;
use dockhand::vm::persist::StateStore;
use dockhand::vm::vfkit::VfkitHypervisor;
use dockhand::vm::Supervisor;

/// VM lifecycle supervisor for containerized workloads
#[derive(Parser, Debug)]
#[command(name = "dockhand", version, about = "VM lifecycle supervisor")]
struct Args {
    /// Config file (defaults to ~/.config/dockhand/dockhand.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at info level instead of warn
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Boot the guest and supervise it until interrupted
    Run,
    /// Print the persisted session record
    Status,
    /// Stop the guest if needed and delete its disk images
    Destroy,
    /// Print the last lines of workload output
    Logs {
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: u32,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let paths = DockhandPaths::resolve().context("HOME is not set")?;
    let _log_guard = dockhand::logging::init(&paths.logs, args.verbose);

    let config_path = args.config.clone().unwrap_or_else(|| paths.config_file());

    if let Cmd::Status = args.command {
        return print_status(&paths);
    }

    let config = DockhandConfig::load(&config_path)
        .with_context(|| format!("load {}", config_path.display()))?;
    paths.ensure().context("create application directories")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    let result = runtime.block_on(execute(args.command, config, paths));

    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn execute(command: Cmd, config: DockhandConfig, paths: DockhandPaths) -> Result<()> {
    let hypervisor = Arc::new(VfkitHypervisor::new(config.vfkit.clone(), paths.socket_dir()));
    let supervisor = Supervisor::new(config.resolve(&paths), hypervisor)?;

    match command {
        Cmd::Run => run(supervisor).await,
        Cmd::Destroy => {
            supervisor.destroy().await.map_err(report)?;
            println!("destroyed");
            Ok(())
        }
        Cmd::Logs { lines } => {
            supervisor.start().await.map_err(report)?;
            match supervisor.guest_logs(lines).await {
                Some(text) => print!("{text}"),
                None => eprintln!("guest did not return any logs"),
            }
            supervisor.stop().await.map_err(report)?;
            Ok(())
        }
        Cmd::Status => print_status(&paths),
    }
}

fn print_status(paths: &DockhandPaths) -> Result<()> {
    let store = StateStore::new(paths.state_file());
    match store.recover() {
        Some(record) => println!(
            "{} (pid {}, since {})",
            record.state,
            record.pid,
            record.timestamp.to_rfc3339()
        ),
        None => println!("stopped"),
    }
    Ok(())
}

/// Attach the remediation hint to a supervisor error.
fn report(err: SupervisorError) -> anyhow::Error {
    match err.remediation() {
        Some(hint) => anyhow::anyhow!("{err}\n  hint: {hint}"),
        None => anyhow::anyhow!("{err}"),
    }
}

async fn run(supervisor: Supervisor) -> Result<()> {
    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SupervisorEvent::StateChanged(change) => match change.reason {
                    Some(reason) => eprintln!("{} -> {}: {reason}", change.from, change.to),
                    None => eprintln!("{} -> {}", change.from, change.to),
                },
                SupervisorEvent::DiskWarning { used_mb, total_mb } => {
                    eprintln!("warning: guest disk {used_mb}/{total_mb} MB used");
                }
                SupervisorEvent::HostWarning(message) => eprintln!("warning: {message}"),
                SupervisorEvent::ConnectionsRebuilt { cancelled } => {
                    info!(cancelled, "forwarded connections rebuilt after wake");
                }
            }
        }
    });

    supervisor.start().await.map_err(report)?;
    if let Ok(snapshot) = supervisor.snapshot().await {
        for addr in snapshot.forwarding {
            println!("forwarding {addr}");
        }
    }

    wait_for_interrupt(&supervisor).await?;

    info!("interrupt received; stopping guest");
    supervisor.stop().await.map_err(report)?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_interrupt(supervisor: &Supervisor) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sleep = signal(SignalKind::user_defined1()).context("install SIGUSR1 handler")?;
    let mut wake = signal(SignalKind::user_defined2()).context("install SIGUSR2 handler")?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("wait for Ctrl-C")?;
                return Ok(());
            }
            _ = sleep.recv() => {
                if let Err(e) = supervisor.suspend().await {
                    warn!(error = %e, "suspend failed");
                }
            }
            _ = wake.recv() => {
                if let Err(e) = supervisor.resume().await {
                    warn!(error = %e, "resume failed");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt(_supervisor: &Supervisor) -> Result<()> {
    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
    Ok(())
}
