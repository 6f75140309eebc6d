//! Server startup utilities.

use relay_config::AppConfig;
use relay_jobs::HealthReport;
use tracing::{info, warn};

/// Prints the startup banner.
pub fn print_banner() {
    info!(r#"
    ____       __
   / __ \___  / /___ ___  __
  / /_/ / _ \/ / __ `/ / / /
 / _, _/  __/ / /_/ / /_/ /
/_/ |_|\___/_/\__,_/\__, /
                   /____/
    "#);
}

/// Prints what this process is running.
pub fn print_startup_info(config: &AppConfig, report: &HealthReport) {
    let separator = "=".repeat(60);
    info!("{}", separator);
    info!("Environment: {}", config.app.environment);
    info!("Driver:      {}", report.driver);
    info!("Queues:      {}", report.queues.len());
    info!("Workers:     {}", report.workers.len());
    match &report.scheduler {
        Some(stats) => info!("Scheduler:   region {}", stats.region),
        None => info!("Scheduler:   disabled"),
    }
    if report.degraded {
        warn!("Running degraded on the in-memory driver; jobs are not durable");
    }
    info!("{}", separator);
}
