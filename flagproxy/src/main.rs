mod config;
mod observability;

use clap::Parser;
use config::Config;
use config_sync::ConfigSync;
use config_sync::authority::{AuthorityError, HttpAuthority};
use config_sync::engine::{Engine, NoopEvaluator};
use config_sync::storage::build_backends;
use proxy::{AppState, ProxyError};
use reporting::sink::{HttpReportSink, ReportError};
use reporting::{FlushTask, ReportingAggregator};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(version, about = "Caching proxy for feature flag configuration")]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, short, default_value = "flagproxy.yaml")]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum RunError {
    #[error("authority client: {0}")]
    Authority(#[from] AuthorityError),
    #[error("report sink: {0}")]
    Report(#[from] ReportError),
    #[error("server: {0}")]
    Proxy(#[from] ProxyError),
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config {}: {e}", cli.config.display());
            process::exit(1);
        }
    };

    // Held until exit so pending sentry events are flushed.
    let _sentry = match observability::init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to set up logging: {e}");
            process::exit(1);
        }
    };

    if let Some(metrics_config) = &config.metrics
        && let Err(e) = observability::init_metrics(metrics_config)
    {
        tracing::error!(error = %e, "Failed to set up metrics, continuing without them");
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start the runtime");
            process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(config)) {
        tracing::error!(error = %e, "Flag proxy stopped");
        process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), RunError> {
    let engine = Arc::new(Engine::new(Arc::new(NoopEvaluator::new())));
    let authority = Arc::new(HttpAuthority::new(
        &config.authority.url,
        config.authority.api_key.clone(),
    )?);
    let backends = build_backends(&config.storages);
    let sync = ConfigSync::new(authority, backends, engine, config.sync.clone());

    let (reporting, flush_task) = if config.reporting.enabled {
        let sink = Arc::new(HttpReportSink::new(
            config.reporting.url.clone(),
            config.authority.api_key.clone(),
        )?);
        let aggregator = Arc::new(ReportingAggregator::new(sink, &config.reporting));
        let task = FlushTask::spawn(aggregator.clone(), config.reporting.flush_interval());
        (Some(aggregator), Some(task))
    } else {
        tracing::info!("Usage reporting disabled");
        (None, None)
    };

    let state = AppState::new(sync.clone(), reporting, config.auth.clone());
    let result = proxy::serve(&config.listener, state, shutdown_signal()).await;

    if let Some(task) = flush_task {
        task.shutdown().await;
    }
    sync.shutdown().await;

    result?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutting down");
}
