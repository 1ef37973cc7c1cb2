//! MediaHub Server — task engine host process
//!
//! Main entry point that wires configuration, logging, and the task service
//! together and runs until a shutdown signal arrives.

use tracing;
use tracing_subscriber::{EnvFilter, fmt};

use mediahub_core::config::AppConfig;
use mediahub_core::error::AppError;
use mediahub_task::{JobRegistry, TaskService};

#[tokio::main]
async fn main() {
    let config = match load_configuration() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = run(config).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

/// Load configuration from `config/` and the environment
fn load_configuration() -> Result<AppConfig, AppError> {
    let env = std::env::var("MEDIAHUB_ENV").unwrap_or_else(|_| "development".to_string());
    AppConfig::load(&env)
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

/// Job functions are contributed by the media subsystems linked into this
/// binary. Each registers its handlers here before the service starts.
fn build_registry() -> JobRegistry {
    let registry = JobRegistry::new();
    tracing::info!(
        "Job registry built with {} job(s)",
        registry.registered_jobs().len()
    );
    registry
}

/// Main server run function
async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting MediaHub v{}", env!("CARGO_PKG_VERSION"));

    let service = TaskService::new(config.worker.clone(), build_registry());
    service.run();

    shutdown_signal().await?;
    tracing::info!("Shutdown signal received, starting graceful shutdown...");

    service.shutdown().await;
    tracing::info!("MediaHub stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() -> Result<(), AppError> {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| AppError::internal(format!("Failed to install Ctrl+C handler: {}", e)))
    };

    #[cfg(unix)]
    let terminate = async {
        let mut signal =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).map_err(
                |e| AppError::internal(format!("Failed to install SIGTERM handler: {}", e)),
            )?;
        signal.recv().await;
        Ok::<(), AppError>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<(), AppError>>();

    tokio::select! {
        res = ctrl_c => res,
        res = terminate => res,
    }
}
