//! Generation pipeline engine binary.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fable_engine::{
    metrics, BudgetTracker, EngineConfig, FfmpegMerger, GenerationLedger, PipelineRunner,
    RunExecutor, StatusReporter,
};
use fable_providers::{
    CircuitConfig, CircuitRegistry, FallbackCatalog, FallbackSelector, HttpProviderAdapter,
    ProviderAdapter,
};
use fable_queue::{ControlChannel, ProgressChannel, RunQueue, StatusStore};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("fable=info".parse().unwrap());

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting fable-engine");

    metrics::init_metrics();

    let config = EngineConfig::from_env();
    info!("Engine config: {:?}", config);

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

    let queue = match RunQueue::from_env() {
        Ok(q) => Arc::new(q),
        Err(e) => {
            error!("Failed to create run queue: {}", e);
            std::process::exit(1);
        }
    };
    let store = match StatusStore::new(&redis_url) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create status store: {}", e);
            std::process::exit(1);
        }
    };
    let progress = match ProgressChannel::new(&redis_url) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to create progress channel: {}", e);
            std::process::exit(1);
        }
    };
    let control = match ControlChannel::new(&redis_url) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to create control channel: {}", e);
            std::process::exit(1);
        }
    };

    let adapter = match HttpProviderAdapter::from_env() {
        Ok(a) => Arc::new(a) as Arc<dyn ProviderAdapter>,
        Err(e) => {
            error!("Provider gateway configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let catalog = FallbackCatalog::with_defaults();
    if let Err(e) = catalog.validate() {
        error!("Provider catalog rejected: {}", e);
        std::process::exit(1);
    }

    let circuits = CircuitRegistry::new(CircuitConfig {
        failure_threshold: config.circuit_failure_threshold,
        cooldown: config.circuit_cooldown,
    });
    let selector = Arc::new(FallbackSelector::new(
        adapter,
        Arc::new(catalog),
        Arc::new(circuits),
        config.provider_timeout,
    ));

    let ledger = Arc::new(GenerationLedger::new());
    let budget = Arc::new(BudgetTracker::new());
    let merger = Arc::new(FfmpegMerger::new(&config));
    let reporter = Arc::new(StatusReporter::new(store, progress));

    let runner = Arc::new(PipelineRunner::new(
        config.clone(),
        Arc::clone(&ledger),
        budget,
        selector,
        merger,
        Arc::clone(&reporter),
    ));

    let executor = Arc::new(RunExecutor::new(
        config, queue, control, runner, ledger, reporter,
    ));

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_executor.shutdown();
    });

    if let Err(e) = executor.run().await {
        error!("Executor error: {}", e);
        std::process::exit(1);
    }

    info!("Engine shutdown complete");
}

/// Wait for SIGINT or SIGTERM so the engine drains cleanly whether it is
/// stopped interactively or by a process manager.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
