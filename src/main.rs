use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use serde::Serialize;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use synclimit::config::SynclimitConfig;
use synclimit::store::{self, CounterStore, StoreError};
use synclimit::{Limiter, Window};

/// Distributed sliding-window rate limiter.
#[derive(Debug, Parser)]
#[command(name = "synclimit", version, about)]
struct Cli {
    /// Configuration file (YAML); defaults are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive several limiter instances sharing one store and report admissions
    Simulate {
        /// Number of limiter instances
        #[arg(short, long, default_value_t = 3)]
        instances: usize,

        /// Requests per second issued by each instance
        #[arg(short, long, default_value_t = 200)]
        rate: u32,

        /// How long to run, in seconds
        #[arg(short, long, default_value_t = 5)]
        duration_secs: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check that the configured store is reachable
    Ping,
}

#[derive(Debug, Default, Serialize)]
struct InstanceReport {
    instance: usize,
    allowed: u64,
    rejected: u64,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    key: String,
    instances: Vec<InstanceReport>,
    duration_secs: u64,
    threshold: u64,
    stat_interval_ms: u64,
    total_allowed: u64,
    /// Admissions a single exact limiter would have allowed at most.
    ceiling: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting synclimit");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => SynclimitConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SynclimitConfig::default(),
    };
    info!(
        key = %config.limiter.key,
        threshold = config.limiter.threshold,
        stat_interval_ms = config.limiter.stat_interval_ms,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    // An unreachable store is fatal here rather than a runtime error.
    let store_handle = store::connect(&config.store)
        .await
        .context("connecting to counter store")?;

    let outcome = match cli.command {
        Command::Ping => ping(store_handle.store().as_ref(), &config.limiter.key).await,
        Command::Simulate {
            instances,
            rate,
            duration_secs,
            json,
        } => simulate(&config, store_handle.store(), instances, rate, duration_secs)
            .await
            .and_then(|report| print_report(&report, json)),
    };

    store_handle
        .shutdown()
        .await
        .context("stopping counter store")?;
    outcome?;

    info!("synclimit stopped");
    Ok(())
}

async fn ping(store: &dyn CounterStore, key: &str) -> anyhow::Result<()> {
    match store.get(key, 0).await {
        Ok(_) | Err(StoreError::NotFound(_)) => {
            println!("ok");
            Ok(())
        }
        Err(e) => Err(e).context("store ping failed"),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn simulate(
    config: &SynclimitConfig,
    store: Arc<dyn CounterStore>,
    instances: usize,
    rate: u32,
    duration_secs: u64,
) -> anyhow::Result<SimulationReport> {
    anyhow::ensure!(instances > 0, "at least one instance is required");
    anyhow::ensure!(rate > 0, "rate must be greater than zero");

    let limiter_config = &config.limiter;
    let mut limiters = Vec::with_capacity(instances);
    for _ in 0..instances {
        let mut window = Window::new(limiter_config.key.clone());
        if config.sync.enabled {
            window = window.with_synchronizer(store.clone(), config.sync.interval())?;
        }
        let limiter = Limiter::new(limiter_config.stat_interval(), limiter_config.threshold, window)?
            .with_limit_evenly(limiter_config.limit_evenly);
        limiters.push(Arc::new(limiter));
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let period = Duration::from_secs_f64(1.0 / f64::from(rate));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration_secs);

    info!(instances, rate, duration_secs, "Starting simulation");

    let tasks = limiters.iter().enumerate().map(|(instance, limiter)| {
        let limiter = limiter.clone();
        let mut stop_rx = stop_rx.clone();
        tokio::spawn(async move {
            let mut report = InstanceReport {
                instance,
                ..Default::default()
            };
            // Stagger instances so they do not fire in lockstep.
            let offset = rand::thread_rng().gen_range(0..=period.as_micros() as u64);
            tokio::time::sleep(Duration::from_micros(offset)).await;

            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = ticker.tick() => {
                        if limiter.allow() {
                            report.allowed += 1;
                        } else {
                            report.rejected += 1;
                        }
                    }
                }
            }
            report
        })
    });
    let run = futures::future::join_all(tasks);
    tokio::pin!(run);

    let results = tokio::select! {
        results = &mut run => results,
        _ = shutdown_signal() => {
            let _ = stop_tx.send(true);
            run.await
        }
    };

    for limiter in &limiters {
        limiter.stop_sync();
    }

    let mut reports = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(report) => reports.push(report),
            Err(e) => warn!(error = %e, "Simulation task failed"),
        }
    }

    let total_allowed = reports.iter().map(|r| r.allowed).sum();
    let buckets = (duration_secs * 1000).div_ceil(limiter_config.stat_interval_ms.max(1));
    Ok(SimulationReport {
        key: limiter_config.key.clone(),
        instances: reports,
        duration_secs,
        threshold: limiter_config.threshold,
        stat_interval_ms: limiter_config.stat_interval_ms,
        total_allowed,
        ceiling: (buckets + 1) * limiter_config.threshold,
    })
}

fn print_report(report: &SimulationReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "key={} threshold={} per {}ms over {}s",
        report.key, report.threshold, report.stat_interval_ms, report.duration_secs
    );
    for instance in &report.instances {
        println!(
            "  instance {:>3}: allowed {:>8}  rejected {:>8}",
            instance.instance, instance.allowed, instance.rejected
        );
    }
    println!(
        "total allowed {} (single-limiter ceiling {})",
        report.total_allowed, report.ceiling
    );
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
