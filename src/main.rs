//! matrix-relay: runs a router, a compute server and a batch of clients,
//! then reports the averaged metrics.

use matrix_relay::config::Config;
use matrix_relay::supervisor::Supervisor;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        router = %config.router_listen,
        compute = %config.compute_listen,
        workers = config.workers,
        max_relays = ?config.max_relays,
        clients = config.clients,
        matrix_size = config.matrix_size,
        "Starting matrix-relay"
    );

    let report = Supervisor::run(&config).await?;

    for (client_id, metrics) in &report.sessions {
        info!(
            client_id,
            execution_time_ns = metrics.execution_time_ns,
            speed_up = metrics.speed_up,
            efficiency = metrics.efficiency,
            "Client result"
        );
    }

    match report.summary {
        Some(summary) => info!(
            sessions = summary.sessions,
            failed = report.failed,
            average_execution_time_ns = summary.mean_execution_time_ns,
            average_speed_up = %format!("{:.4}", summary.mean_speed_up),
            average_efficiency = %format!("{:.3}%", summary.mean_efficiency * 100.0),
            "Run complete"
        ),
        None => warn!(failed = report.failed, "No client session succeeded"),
    }

    Ok(())
}
