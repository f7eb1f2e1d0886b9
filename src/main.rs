//! elephant entry point: CLI wiring, config loading, and service startup.

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use elephant::api::{self, AppState};
use elephant::cli::{self, CliOptions, Command};
use elephant::config::AppConfig;
use elephant::ingest::{Ingestor, SourceFilter};
use elephant::io::export::export_calls_csv;
use elephant::providers::ProviderRegistry;
use elephant::sim::SimulationEngine;
use elephant::sim::types::RunId;
use elephant::store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    let opts = match cli::parse_args() {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("error: {msg}");
            cli::print_usage();
            process::exit(2);
        }
    };
    if opts.command == Command::Help {
        cli::print_usage();
        return Ok(());
    }

    let config = load_config(&opts);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase())),
        )
        .init();

    let store = SqliteStore::open(&config.database.path, config.database.busy_timeout())
        .with_context(|| format!("opening database {}", config.database.path.display()))?;
    let engine = SimulationEngine::with_system_clock(Arc::new(store.clone()));

    if let Command::ExportStats { run_id, out } = &opts.command {
        let calls = engine.stats(&RunId::from(run_id.as_str()))?;
        export_calls_csv(&calls, out)
            .with_context(|| format!("writing {}", out.display()))?;
        info!(run_id = %run_id, rows = calls.len(), path = %out.display(), "call history exported");
        return Ok(());
    }

    let providers = ProviderRegistry::from_config(&config)?;
    let ingestor = Arc::new(Ingestor::new(
        config.cron.sources.clone(),
        providers,
        store.clone(),
    ));

    if opts.command == Command::Once {
        let report = ingestor.run_once(&SourceFilter::default()).await;
        info!(?report, "ingestion pass finished");
        if report.failed > 0 {
            anyhow::bail!("{} source(s) failed", report.failed);
        }
        return Ok(());
    }

    let no_scheduler = matches!(opts.command, Command::Serve { no_scheduler: true });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = if no_scheduler || config.cron.sources.is_empty() {
        info!("ingestion scheduler disabled");
        None
    } else {
        Some(ingestor.clone().spawn_scheduler(config.cron.interval(), shutdown_rx))
    };

    let bind = opts
        .bind
        .clone()
        .unwrap_or_else(|| config.server.bind_addr());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;

    let state = Arc::new(AppState {
        engine,
        store,
        config,
        ingestor,
    });
    api::serve(state, listener, shutdown_signal()).await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            warn!(error = %e, "ingestion scheduler ended abnormally");
        }
    }
    info!("shutdown complete");
    Ok(())
}

/// Loads, overrides, and validates configuration, exiting on any error.
fn load_config(opts: &CliOptions) -> AppConfig {
    let mut config = match &opts.config {
        Some(path) => AppConfig::from_toml_file(path).unwrap_or_else(|e| {
            eprintln!("{e}");
            process::exit(1);
        }),
        None => AppConfig::default(),
    };
    config.apply_env();

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }
    config
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
