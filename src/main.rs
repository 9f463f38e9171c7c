//! orphand command-line interface

use anyhow::Context;
use clap::{Parser, Subcommand};
use orphand::daemon;
use orphand::{
    with_exclusive_access, Coordinator, DaemonLauncher, PairStore, SupervisorConfig,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "orphand", version, about = "Supervises main/child process pairs and reaps orphaned children")]
struct Cli {
    /// State directory (defaults to $ORPHAND_STATE_DIR or the system temp dir)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a main/child pair and make sure the daemon is running
    Add {
        /// Pid of the main process
        main_pid: u32,
        /// Pid of the child to terminate when the main process exits
        child_pid: u32,
    },
    /// Unregister a pair without touching either process
    Remove {
        main_pid: u32,
        child_pid: u32,
    },
    /// Print the registered pairs
    List,
    /// Run the supervision loop in the foreground
    Monitor {
        /// Advertise this process through the daemon pid file
        #[arg(long)]
        headless: bool,
        /// Seconds between pair checks
        #[arg(long, default_value_t = 3)]
        interval: u64,
        /// Exit after this many seconds with no pairs tracked
        #[arg(long)]
        exit_after_idle: Option<u64>,
    },
    /// Stop the background daemon
    Stop,
    /// Report whether a daemon is running
    Status,
}

fn build_config(cli: &Cli) -> SupervisorConfig {
    match &cli.state_dir {
        Some(dir) => SupervisorConfig::with_state_dir(dir),
        None => SupervisorConfig::default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli);

    match cli.command {
        Commands::Add { main_pid, child_pid } => {
            with_exclusive_access(config.clone(), move |coord| {
                Box::pin(async move { coord.add_pair(main_pid, child_pid).await })
            })
            .await
            .context("failed to add pair")?;
            println!("registered pair {main_pid} -> {child_pid}");

            let mut launcher = DaemonLauncher::new(&config);
            if !launcher.is_running() {
                launcher.launch(&config).context("failed to launch daemon")?;
            }
        }
        Commands::Remove { main_pid, child_pid } => {
            let removed = with_exclusive_access(config, move |coord| {
                Box::pin(async move { coord.remove_pair(main_pid, child_pid).await })
            })
            .await
            .context("failed to remove pair")?;
            if removed {
                println!("removed pair {main_pid} -> {child_pid}");
            } else {
                println!("pair {main_pid} -> {child_pid} is not registered");
            }
        }
        Commands::List => {
            // Read-only, so no need to suspend the daemon.
            let pairs = PairStore::new(config.pairs_path()).load_all();
            if pairs.is_empty() {
                println!("no pairs registered");
            } else {
                for pair in pairs {
                    println!("{pair}");
                }
            }
        }
        Commands::Monitor {
            headless,
            interval,
            exit_after_idle,
        } => {
            let mut config = config;
            config.check_interval = Duration::from_secs(interval.max(1));
            config.exit_after_idle = exit_after_idle.map(Duration::from_secs);
            run_monitor(config, headless).await?;
        }
        Commands::Stop => {
            let mut launcher = DaemonLauncher::new(&config);
            if launcher
                .terminate()
                .await
                .context("failed to stop daemon")?
            {
                println!("daemon stopped");
            } else {
                error!("daemon did not stop");
                std::process::exit(1);
            }
        }
        Commands::Status => {
            let mut launcher = DaemonLauncher::new(&config);
            match launcher.discover() {
                Some(pid) => println!("daemon running (pid {pid})"),
                None => println!("daemon not running"),
            }
        }
    }
    Ok(())
}

async fn run_monitor(config: SupervisorConfig, headless: bool) -> anyhow::Result<()> {
    let pidfile = config.daemon_pidfile();
    let coordinator = Coordinator::start(config)
        .await
        .context("failed to start supervisor")?;

    let own_pid = std::process::id();
    if headless {
        daemon::publish_pid(&pidfile, own_pid).context("failed to publish daemon pid")?;
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    info!(pid = own_pid, headless, "supervisor running");
    coordinator.run(cancel).await;

    if headless {
        daemon::clear_pid(&pidfile, own_pid);
    }
    info!("supervisor stopped");
    Ok(())
}

#[cfg(unix)]
fn spawn_signal_handler(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            r = tokio::signal::ctrl_c() => {
                if let Err(e) = r {
                    error!(error = %e, "ctrl-c handler failed");
                }
                info!("received interrupt");
            }
        }
        cancel.cancel();
    });
}

#[cfg(not(unix))]
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt");
        }
        cancel.cancel();
    });
}
