//! pdsd: the Proton Drive sync agent daemon.
//!
//! Usage:
//!   pdsd start [--no-watch] [--dry-run] [--paused]
//!   pdsd stop | pause | resume | reload
//!   pdsd reset [--signals-only] [--retry-timers-only]

mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pds_core::config::Config;
use pds_core::types::Signal;
use pds_drive::NoOpAuthProvider;
use pds_engine::{Engine, EngineOptions};
use pds_store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pdsd", version, about = "Proton Drive sync agent daemon")]
struct Cli {
    /// Path to the JSON config document.
    #[arg(long, short = 'c', env = "PDS_CONFIG", default_value = "/etc/protondrive-sync/config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine in the foreground until a stop signal arrives.
    Start {
        /// Classify from the durable cache only; skip spawning live watchers.
        #[arg(long)]
        no_watch: bool,
        /// Skip all state-store and network writes; log what would happen.
        #[arg(long)]
        dry_run: bool,
        /// Start with the control loop paused.
        #[arg(long)]
        paused: bool,
        /// Local directory standing in for the authenticated remote drive.
        #[arg(long, env = "PDS_LOCAL_DRIVE_ROOT")]
        local_drive_root: Option<PathBuf>,
        /// Grace period to drain in-flight jobs on shutdown.
        #[arg(long, default_value = "10")]
        shutdown_grace_secs: u64,
    },
    /// Enqueue a `stop` signal on the running daemon's state store.
    Stop,
    /// Enqueue a `pause` signal.
    Pause,
    /// Enqueue a `resume` signal.
    Resume,
    /// Enqueue a `reload` signal; the running daemon re-reads its config
    /// file and applies whatever is safe to change live (§4.6).
    Reload,
    /// Clear state-store data.
    Reset {
        /// Only drain the signal queue.
        #[arg(long)]
        signals_only: bool,
        /// Only zero out retry counters/backoff timers.
        #[arg(long)]
        retry_timers_only: bool,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("pdsd: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Start {
            no_watch,
            dry_run,
            paused,
            local_drive_root,
            shutdown_grace_secs,
        } => {
            let _guard = logging::init(&config)?;
            info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "pdsd starting");

            let mut config = config;
            config.dry_run = config.dry_run || dry_run;
            config.validate().map_err(|e| anyhow::anyhow!("{e}")).context("invalid configuration")?;

            let drive_root = local_drive_root.unwrap_or_else(|| {
                config
                    .state_db_path
                    .parent()
                    .map(|p| p.join("drive-mirror"))
                    .unwrap_or_else(|| PathBuf::from("./drive-mirror"))
            });
            std::fs::create_dir_all(&drive_root)
                .with_context(|| format!("creating local drive root {}", drive_root.display()))?;
            let auth = Arc::new(NoOpAuthProvider::new(drive_root));

            let options = EngineOptions { no_watch, start_paused: paused };
            let engine = Engine::bootstrap(config.clone(), cli.config.clone(), options, auth)
                .await
                .context("engine bootstrap failed")?;

            if let Some(addr) = config.metrics_addr.clone() {
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = metrics::serve(addr, engine).await {
                        error!("metrics server failed: {e}");
                    }
                });
            }

            engine
                .run(Duration::from_secs(shutdown_grace_secs))
                .await
                .context("engine run failed")?;
            info!("pdsd stopped");
            Ok(())
        }
        Command::Stop => send_signal(&config, Signal::Stop).await,
        Command::Pause => send_signal(&config, Signal::Pause).await,
        Command::Resume => send_signal(&config, Signal::Resume).await,
        Command::Reload => send_signal(&config, Signal::Reload).await,
        Command::Reset { signals_only, retry_timers_only } => {
            let store = Store::open(&config.state_db_path)
                .await
                .with_context(|| format!("opening state store at {}", config.state_db_path.display()))?;
            store
                .reset(signals_only, retry_timers_only)
                .await
                .context("reset failed")?;
            println!("state store reset ({})", reset_description(signals_only, retry_timers_only));
            Ok(())
        }
    }
}

fn reset_description(signals_only: bool, retry_timers_only: bool) -> &'static str {
    if signals_only {
        "signals only"
    } else if retry_timers_only {
        "retry timers only"
    } else {
        "everything"
    }
}

/// `stop`/`pause`/`resume`/`reload` talk to the running daemon only through
/// the shared state store's signal queue; there is no RPC transport (§6).
async fn send_signal(config: &Config, signal: Signal) -> Result<()> {
    let store = Store::open(&config.state_db_path)
        .await
        .with_context(|| format!("opening state store at {}", config.state_db_path.display()))?;
    store.send_signal(signal).await.context("sending signal")?;
    println!("sent {signal}");
    Ok(())
}

fn load_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        Config::load(path).map_err(|e| anyhow::anyhow!("{e}"))
    } else {
        eprintln!("pdsd: config file not found: {} (using defaults)", path.display());
        Ok(Config::default())
    }
}
