//! Drives a full run: compute server, router, and N concurrent clients.

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::client::{random_matrix, Client};
use crate::compute::ComputeServer;
use crate::config::Config;
use crate::error::Result;
use crate::metrics::{Metrics, MetricsSummary};
use crate::router::Router;

/// Outcome of a supervised run.
#[derive(Debug, Clone)]
pub struct SupervisorReport {
    /// Per-client metrics, ordered by client id.
    pub sessions: Vec<(i32, Metrics)>,
    /// Clients whose session failed.
    pub failed: usize,
    /// Means over the successful sessions; `None` if every session failed.
    pub summary: Option<MetricsSummary>,
}

pub struct Supervisor;

impl Supervisor {
    /// Start both servers, run `config.clients` sessions concurrently, then
    /// stop the router and shut the compute server down.
    pub async fn run(config: &Config) -> Result<SupervisorReport> {
        let compute = ComputeServer::bind(&config.compute()).await?.start()?;
        let router = Router::bind(&config.router(compute.local_addr().to_string()))
            .await?
            .start()?;

        let client = Client::new(router.local_addr().to_string());
        let size = config.matrix_size;

        let mut clients = JoinSet::new();
        for client_id in 1..=config.clients as i32 {
            let client = client.clone();
            clients.spawn(async move {
                let (a, b) = {
                    let mut rng = rand::thread_rng();
                    (random_matrix(size, &mut rng), random_matrix(size, &mut rng))
                };
                info!(client_id, size, "Starting client");
                (client_id, client.submit(client_id, a, b).await)
            });
        }

        let mut sessions = Vec::with_capacity(config.clients);
        let mut failed = 0;
        while let Some(joined) = clients.join_next().await {
            match joined? {
                (client_id, Ok(result)) => sessions.push((client_id, result.metrics)),
                (client_id, Err(e)) => {
                    warn!(client_id, error = %e, "Client session failed");
                    failed += 1;
                }
            }
        }
        sessions.sort_by_key(|(client_id, _)| *client_id);

        let summary = MetricsSummary::from_metrics(sessions.iter().map(|(_, m)| m));

        info!("All clients complete, shutting down router");
        router.stop();
        router.join().await?;
        compute.shutdown(config.shutdown_timeout()).await?;

        Ok(SupervisorReport {
            sessions,
            failed,
            summary,
        })
    }
}
