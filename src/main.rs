use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use cyclone::config::Config;
use cyclone::engine::Engine;
use cyclone::export::health::HealthMetrics;
use cyclone::{ingest, lookup};

/// Sharded threshold evaluation engine for metric alarming.
#[derive(Parser)]
#[command(name = "cyclone", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("cyclone {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the main engine run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting cyclone",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Build the shared metrics registry first so the lookup client can
    // report into it.
    let metrics =
        Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

    let source = {
        let metrics = Arc::clone(&metrics);
        lookup::Client::new(&cfg.lookup)
            .context("creating threshold lookup client")?
            .with_metrics(Box::new(move |status, duration| {
                metrics.lookup_requests.with_label_values(&[status]).inc();
                metrics.lookup_duration.observe(duration.as_secs_f64());
            }))
    };

    // Start the engine.
    let mut engine = Engine::with_metrics(cfg, source, metrics);
    engine.start().await?;

    // Feed it from stdin until EOF or shutdown.
    let mut ingest_task = tokio::spawn(ingest::run_stdin(engine.input(), engine.cancellation()));
    let mut ingest_result = None;

    // Wait for a shutdown signal, an engine-initiated shutdown, or the
    // end of the input stream.
    let engine_cancel = engine.cancellation();
    tokio::select! {
        _ = shutdown_rx => {}
        _ = engine_cancel.cancelled() => {}
        result = &mut ingest_task => {
            ingest_result = Some(result);
        }
    }

    // Graceful shutdown: the engine drains its shards, then the ingest
    // commit watcher reports the processed-event count.
    engine.stop().await?;

    let ingest_result = match ingest_result {
        Some(result) => result,
        None => ingest_task.await,
    };
    match ingest_result {
        Ok(processed) => tracing::info!(processed, "processed events"),
        Err(e) => tracing::warn!(error = %e, "ingest task join failed"),
    }

    tracing::info!("cyclone stopped");

    Ok(())
}
