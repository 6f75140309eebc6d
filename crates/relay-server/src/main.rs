//! # Relay Server
//!
//! Process entrypoint: loads configuration, selects the queue driver,
//! starts workers for the built-in job kinds and the polling scheduler,
//! and drains them on `SIGINT`/`SIGTERM`.

use relay_config::ConfigLoader;
use relay_core::{init_tracing, RelayError, RelayResult};
use relay_jobs::register_metrics;
use relay_server::app::AppBuilder;
use relay_server::handlers::default_processors;
use relay_server::startup::{print_banner, print_startup_info};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(code = e.error_code(), "Application error: {}", e);
        eprintln!("relay-server: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn run() -> RelayResult<()> {
    let config_loader = ConfigLoader::from_default_location()?;
    let config = config_loader.get().await;

    init_tracing(&config.logging)?;
    register_metrics();

    print_banner();
    info!("Starting Relay {}...", config.app.version);

    let mut builder = AppBuilder::new().with_config(config.clone());
    for (queue, processor) in default_processors() {
        builder = builder.with_processor(queue, processor);
    }
    let mut app = builder.build().await?;

    let report = app.health().await;
    print_startup_info(&config, &report);
    if !report.is_serving() {
        return Err(RelayError::unavailable(
            report.driver.to_string(),
            report.error.unwrap_or_else(|| "health check failed".to_string()),
        ));
    }

    app.start();

    shutdown_signal().await;

    app.shutdown().await?;
    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
