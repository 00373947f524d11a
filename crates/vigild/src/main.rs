//! vigild — the Vigil daemon.
//!
//! Single binary that assembles the monitoring and autoscaling engine:
//! - State store (redb)
//! - Engine (windows, detection, alert lifecycle, policies, convergence)
//! - Ticker
//! - Notification logger
//! - REST API + Prometheus exposition
//!
//! # Usage
//!
//! ```text
//! vigild run --config /etc/vigil/vigil.toml --port 9090 --data-dir /var/lib/vigil
//! vigild check-config /etc/vigil/vigil.toml
//! vigild print-config > vigil.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use vigil_engine::{Engine, Ticker, VecSampleSource, VigilConfig, log_notifications};
use vigil_state::{MetricSample, StateStore};

#[derive(Parser)]
#[command(name = "vigild", about = "Vigil monitoring and autoscaling daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine and serve the API.
    Run {
        /// Path to vigil.toml. Defaults apply when omitted.
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides `server.port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides `server.data_dir`).
        /// Without one, state lives in memory only.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// JSON file holding an array of samples to replay into the engine.
        #[arg(long)]
        replay: Option<PathBuf>,

        /// Samples fed per tick when replaying.
        #[arg(long, default_value = "10")]
        replay_per_tick: usize,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },

    /// Validate a configuration file and exit.
    CheckConfig {
        path: PathBuf,
    },

    /// Print the default configuration as TOML.
    PrintConfig,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,vigild=debug,vigil=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            replay,
            replay_per_tick,
            log_json,
        } => {
            init_tracing(log_json);
            let mut cfg = match &config {
                Some(path) => VigilConfig::from_file(path)?,
                None => VigilConfig::default(),
            };
            if let Some(port) = port {
                cfg.server.port = port;
            }
            if data_dir.is_some() {
                cfg.server.data_dir = data_dir;
            }
            run(cfg, replay.as_deref(), replay_per_tick).await
        }
        Command::CheckConfig { path } => {
            let cfg = VigilConfig::from_file(&path)?;
            cfg.validate()
                .with_context(|| format!("invalid configuration in {}", path.display()))?;
            println!(
                "{}: ok ({} streams, {} rules, {} policies)",
                path.display(),
                cfg.streams.len(),
                cfg.rules.len(),
                cfg.policies.len()
            );
            Ok(())
        }
        Command::PrintConfig => {
            print!("{}", VigilConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn load_replay(path: &Path) -> anyhow::Result<Vec<MetricSample>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading replay file {}", path.display()))?;
    let samples: Vec<MetricSample> = serde_json::from_str(&content)
        .with_context(|| format!("parsing replay file {}", path.display()))?;
    Ok(samples)
}

async fn run(
    config: VigilConfig,
    replay: Option<&Path>,
    replay_per_tick: usize,
) -> anyhow::Result<()> {
    info!("Vigil daemon starting");
    config.validate()?;
    let timings = config.timings()?;
    let port = config.server.port;

    // ── State store ────────────────────────────────────────────

    let store = match &config.server.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let db_path = dir.join("vigil.redb");
            let store = StateStore::open(&db_path)?;
            info!(path = ?db_path, "state store opened");
            store
        }
        None => {
            warn!("no data directory configured, state will not survive restarts");
            StateStore::open_in_memory()?
        }
    };

    // ── Engine ─────────────────────────────────────────────────

    let engine = Arc::new(Engine::builder(config).with_store(store).build()?);
    let state = engine.scaling_state().await;
    info!(
        instances = state.current_instances,
        policies = engine.policies().await.len(),
        "engine initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let mut ticker = Ticker::new(engine.clone(), timings.tick_interval);
    if let Some(path) = replay {
        let samples = load_replay(path)?;
        info!(samples = samples.len(), per_tick = replay_per_tick, "replaying samples");
        ticker = ticker.with_source(Box::new(VecSampleSource::new(samples, replay_per_tick)));
    }
    let ticker_handle = tokio::spawn(ticker.run(shutdown_rx.clone()));

    let notify_handle = tokio::spawn(log_notifications(engine.subscribe(), shutdown_rx));

    // ── Start API server ───────────────────────────────────────

    let router = vigil_api::build_router(engine);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for CTRL+C");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = ticker_handle.await;
    let _ = notify_handle.await;

    info!("Vigil daemon stopped");
    Ok(())
}
