//! TCP server that multiplies matrices.
//!
//! Each accepted connection carries exactly one request. Sessions run on a
//! bounded pool: the accept loop waits for a free slot before accepting, so
//! at most `workers` sessions are in flight and further connections wait in
//! the listen backlog.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{read_frame, write_frame};
use crate::error::{Error, Result};
use crate::metrics::{self, Metrics};
use crate::protocol::{ComputeRequest, ComputeResult, Reply};

/// Largest session pool a compute server accepts.
pub const MAX_WORKERS: usize = 65_536;

/// Settings the compute server needs from its launcher.
#[derive(Debug, Clone)]
pub struct ComputeConfig {
    /// Address to bind to
    pub listen: String,
    /// Session pool size (0 = number of CPUs, at most [`MAX_WORKERS`])
    pub workers: usize,
}

/// A bound, not yet accepting, compute server.
pub struct ComputeServer {
    listener: TcpListener,
    workers: usize,
    processing_units: usize,
}

impl ComputeServer {
    /// Bind the listening socket.
    pub async fn bind(config: &ComputeConfig) -> Result<Self> {
        let processing_units = metrics::processing_units();
        let workers = if config.workers == 0 {
            processing_units.min(MAX_WORKERS)
        } else {
            config.workers
        };
        if workers > MAX_WORKERS {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("workers must be at most {}, got {}", MAX_WORKERS, workers),
            )
            .into());
        }
        let listener = TcpListener::bind(&config.listen).await?;

        Ok(ComputeServer {
            listener,
            workers,
            processing_units,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start accepting connections on a background task.
    pub fn start(self) -> Result<ComputeHandle> {
        let local_addr = self.local_addr()?;
        let workers = u32::try_from(self.workers).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("workers {} does not fit a permit count", self.workers),
            )
        })?;
        let sessions = Arc::new(Semaphore::new(self.workers));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            address = %local_addr,
            workers = self.workers,
            processing_units = self.processing_units,
            "Compute server listening"
        );

        let accept_task = tokio::spawn(accept_loop(
            self.listener,
            Arc::clone(&sessions),
            self.processing_units,
            shutdown_rx,
        ));

        Ok(ComputeHandle {
            local_addr,
            workers,
            sessions,
            shutdown_tx,
            accept_task,
        })
    }
}

/// Handle to a running compute server.
///
/// Dropping the handle without calling [`ComputeHandle::shutdown`] also stops
/// the accept loop; in-flight sessions still run to completion.
pub struct ComputeHandle {
    local_addr: SocketAddr,
    workers: u32,
    sessions: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<Result<()>>,
}

impl ComputeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait up to `timeout` for in-flight sessions.
    ///
    /// Returns the accept loop's own error if it failed earlier, otherwise
    /// `ShutdownTimeout` if sessions were still running when time ran out.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        self.accept_task.await??;

        match tokio::time::timeout(timeout, self.sessions.acquire_many(self.workers)).await
        {
            Ok(_) => {
                info!("Compute server shutdown complete");
                Ok(())
            }
            Err(_) => {
                warn!(
                    in_flight = self.workers as usize - self.sessions.available_permits(),
                    "Sessions still running at shutdown"
                );
                Err(Error::ShutdownTimeout(timeout))
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    sessions: Arc<Semaphore>,
    processing_units: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        // Wait for a session slot
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = Arc::clone(&sessions).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "New compute session");
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, processing_units).await {
                        warn!(peer = %peer, error = %e, "Compute session failed");
                    }
                    drop(permit);
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                return Err(e.into());
            }
        }
    }

    info!("Compute server stopped accepting");
    Ok(())
}

async fn serve(stream: TcpStream, processing_units: usize) -> Result<()> {
    stream.set_nodelay(true)?;
    handle_session(stream, processing_units).await
}

/// Serve one request on `stream`: read the operands, multiply, reply.
///
/// Faults are reported to the peer as a failure reply before the error is
/// returned. A peer that closes without sending anything is not an error.
pub async fn handle_session<S>(mut stream: S, processing_units: usize) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match read_frame::<ComputeRequest, _>(&mut stream).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            trace!("Session closed before a request arrived");
            return Ok(());
        }
        Err(e) => {
            report_failure(&mut stream, &e).await;
            return Err(e);
        }
    };

    trace!(
        a_rows = request.a.rows(),
        a_cols = request.a.cols(),
        b_rows = request.b.rows(),
        b_cols = request.b.cols(),
        "Received operands"
    );

    match compute(request, processing_units).await {
        Ok(result) => {
            debug!(
                execution_time_ns = result.metrics.execution_time_ns,
                speed_up = result.metrics.speed_up,
                "Computed product"
            );
            write_frame(&mut stream, &Reply::Computed(result)).await?;
            stream.shutdown().await?;
            Ok(())
        }
        Err(e) => {
            report_failure(&mut stream, &e).await;
            Err(e)
        }
    }
}

/// Run the engine and the baseline off the async workers.
async fn compute(request: ComputeRequest, processing_units: usize) -> Result<ComputeResult> {
    tokio::task::spawn_blocking(move || {
        let (product, metrics) = Metrics::measure(&request.a, &request.b, processing_units)?;
        Ok(ComputeResult { product, metrics })
    })
    .await?
}

/// Best effort: the peer may already be gone.
async fn report_failure<S>(stream: &mut S, err: &Error)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = write_frame(stream, &Reply::failed(err)).await {
        trace!(error = %e, "Could not deliver failure reply");
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::Matrix;
    use crate::protocol::{FaultKind, Frame};
    use tokio::io::AsyncReadExt;

    fn config() -> ComputeConfig {
        ComputeConfig {
            listen: "127.0.0.1:0".to_string(),
            workers: 2,
        }
    }

    async fn roundtrip(addr: SocketAddr, payload: &[u8]) -> Option<Reply> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(payload).await.unwrap();
        stream.shutdown().await.unwrap();
        read_frame::<Reply, _>(&mut stream).await.unwrap()
    }

    #[tokio::test]
    async fn test_bind_defaults_workers_to_cpus() {
        let server = ComputeServer::bind(&ComputeConfig {
            listen: "127.0.0.1:0".to_string(),
            workers: 0,
        })
        .await
        .unwrap();
        assert_eq!(server.workers, metrics::processing_units());
    }

    #[tokio::test]
    async fn test_bind_rejects_oversized_pool() {
        let result = ComputeServer::bind(&ComputeConfig {
            listen: "127.0.0.1:0".to_string(),
            workers: MAX_WORKERS + 1,
        })
        .await;
        match result {
            Err(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::InvalidInput),
            Err(other) => panic!("Expected InvalidInput, got {:?}", other),
            Ok(_) => panic!("Expected an oversized pool to be rejected"),
        }
    }

    #[tokio::test]
    async fn test_session_computes_product() {
        let handle = ComputeServer::bind(&config()).await.unwrap().start().unwrap();
        let request = ComputeRequest {
            a: Matrix::from_rows(vec![vec![1, 2], vec![3, 4]]).unwrap(),
            b: Matrix::from_rows(vec![vec![5, 6], vec![7, 8]]).unwrap(),
        };

        let reply = roundtrip(handle.local_addr(), &request.encode()).await.unwrap();
        let result = reply.into_result().unwrap();
        assert_eq!(result.product.to_rows(), vec![vec![19, 22], vec![43, 50]]);
        assert!(result.metrics.speed_up >= 0.0);

        handle.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_reports_dimension_mismatch() {
        let handle = ComputeServer::bind(&config()).await.unwrap().start().unwrap();
        let request = ComputeRequest {
            a: Matrix::zeros(2, 3),
            b: Matrix::zeros(2, 2),
        };

        let reply = roundtrip(handle.local_addr(), &request.encode()).await.unwrap();
        match reply.into_result() {
            Err(Error::Remote { kind, .. }) => assert_eq!(kind, FaultKind::DimensionMismatch),
            other => panic!("Expected dimension mismatch, got {:?}", other),
        }

        handle.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_session_does_not_affect_others() {
        let handle = ComputeServer::bind(&config()).await.unwrap().start().unwrap();
        let addr = handle.local_addr();

        let request = ComputeRequest {
            a: Matrix::from_rows(vec![vec![2]]).unwrap(),
            b: Matrix::from_rows(vec![vec![3]]).unwrap(),
        };
        let bytes = request.encode();

        let reply = roundtrip(addr, &bytes[..bytes.len() - 1]).await.unwrap();
        match reply {
            Reply::Failed(fault) => assert_eq!(fault.kind, FaultKind::MalformedPayload),
            other => panic!("Expected failure reply, got {:?}", other),
        }

        let reply = roundtrip(addr, &bytes).await.unwrap();
        assert_eq!(reply.into_result().unwrap().product[(0, 0)], 6);

        handle.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_session_closes_quietly() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        handle_session(server, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_session_over_duplex() {
        let (mut client, server) = tokio::io::duplex(1024);
        let session = tokio::spawn(handle_session(server, 4));

        let request = ComputeRequest {
            a: Matrix::from_rows(vec![vec![1, 0, 2]]).unwrap(),
            b: Matrix::from_rows(vec![vec![1], vec![5], vec![3]]).unwrap(),
        };
        write_frame(&mut client, &request).await.unwrap();

        let mut bytes = Vec::new();
        client.read_to_end(&mut bytes).await.unwrap();
        session.await.unwrap().unwrap();

        match Reply::parse(&bytes) {
            crate::protocol::ParseResult::Complete(reply, _) => {
                assert_eq!(reply.into_result().unwrap().product[(0, 0)], 7);
            }
            other => panic!("Expected reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_times_out_with_stuck_session() {
        let handle = ComputeServer::bind(&config()).await.unwrap().start().unwrap();

        // Holds a slot without ever sending a full request.
        let mut stuck = TcpStream::connect(handle.local_addr()).await.unwrap();
        stuck.write_all(&[0, 0]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = handle
            .shutdown(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShutdownTimeout(_)));
    }
}
