//! Front-facing TCP router.
//!
//! Every accepted client socket gets its own relay task, which opens a fresh
//! connection to the compute server, registers it in the router's
//! [`ConnectionRegistry`], forwards the request and relays the reply back.
//!
//! By default the fan-out is one task per accepted socket with no ceiling.
//! Setting `max_relays` bounds it: the accept loop then waits for a free slot
//! before accepting the next client.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{read_frame, write_frame};
use crate::error::{Error, Result};
use crate::protocol::{ComputeRequest, Reply, RoutedRequest};
use crate::registry::{BackendLink, ConnectionRegistry, RelayKey};

/// Settings the router needs from its launcher.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Address to bind to
    pub listen: String,
    /// Compute server address
    pub backend: String,
    /// Maximum concurrent relays (None = unbounded)
    pub max_relays: Option<usize>,
}

/// A bound, not yet accepting, router.
pub struct Router {
    listener: TcpListener,
    backend: SocketAddr,
    relay_limit: Option<Arc<Semaphore>>,
    registry: Arc<ConnectionRegistry>,
}

impl Router {
    /// Bind the listening socket and resolve the backend address.
    ///
    /// A relay limit of zero is rejected: the router could never serve a client.
    pub async fn bind(config: &RouterConfig) -> Result<Self> {
        if config.max_relays == Some(0) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "max_relays must be at least 1",
            )
            .into());
        }

        let backend = tokio::net::lookup_host(&config.backend)
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("backend address '{}' did not resolve", config.backend),
                )
            })?;
        let listener = TcpListener::bind(&config.listen).await?;

        Ok(Router {
            listener,
            backend,
            relay_limit: config.max_relays.map(|n| Arc::new(Semaphore::new(n))),
            registry: Arc::new(ConnectionRegistry::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Start accepting clients on a background task.
    pub fn start(self) -> Result<RouterHandle> {
        let local_addr = self.local_addr()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let registry = Arc::clone(&self.registry);

        info!(
            address = %local_addr,
            backend = %self.backend,
            max_relays = ?self.relay_limit.as_ref().map(|s| s.available_permits()),
            "Router listening"
        );

        let accept_task = tokio::spawn(self.accept_loop(stop_rx));

        Ok(RouterHandle {
            local_addr,
            registry,
            stop_tx,
            accept_task,
        })
    }

    async fn accept_loop(self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let mut next_session = 0u64;

        loop {
            let permit = match &self.relay_limit {
                Some(limit) => tokio::select! {
                    _ = stop.changed() => break,
                    permit = Arc::clone(limit).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let accepted = tokio::select! {
                _ = stop.changed() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    next_session += 1;
                    debug!(peer = %peer, session = next_session, "New client connected");
                    let worker = RelayWorker {
                        session: next_session,
                        peer,
                        client: stream,
                        backend: self.backend,
                        registry: Arc::clone(&self.registry),
                    };
                    tokio::spawn(worker.run_with_permit(permit));
                }
                Err(e) => {
                    if *stop.borrow() {
                        break;
                    }
                    error!(error = %e, "Failed to accept connection");
                    return Err(e.into());
                }
            }
        }

        // Dropping `self` closes the listening socket.
        info!("Router has stopped");
        Ok(())
    }
}

/// Handle to a running router.
///
/// Dropping the handle stops the accept loop, the same as [`RouterHandle::stop`].
pub struct RouterHandle {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    stop_tx: watch::Sender<bool>,
    accept_task: JoinHandle<Result<()>>,
}

impl RouterHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Stop accepting new clients. Relays already running are left alone.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow() || self.accept_task.is_finished()
    }

    /// Wait for the accept loop to exit and return its result.
    pub async fn join(self) -> Result<()> {
        self.accept_task.await?
    }
}

/// Relays one client session to the compute server and back.
struct RelayWorker {
    session: u64,
    peer: SocketAddr,
    client: TcpStream,
    backend: SocketAddr,
    registry: Arc<ConnectionRegistry>,
}

impl RelayWorker {
    async fn run_with_permit(self, permit: Option<OwnedSemaphorePermit>) {
        let session = self.session;
        let peer = self.peer;
        if let Err(e) = self.run().await {
            warn!(session, peer = %peer, error = %e, "Relay failed");
        }
        drop(permit);
    }

    /// Serve the session to completion.
    ///
    /// The registry entry for this session is always removed before
    /// returning, whether the relay succeeded or not.
    async fn run(mut self) -> Result<()> {
        self.client.set_nodelay(true)?;

        let routed = match read_frame::<RoutedRequest, _>(&mut self.client).await {
            Ok(Some(routed)) => routed,
            Ok(None) => {
                trace!(session = self.session, "Client left before sending a request");
                return Ok(());
            }
            Err(e) => {
                self.report_failure(&e).await;
                return Err(e);
            }
        };

        let key = RelayKey {
            session: self.session,
            client_id: routed.client_id,
        };

        let outcome = self.relay(key, &routed.request).await;
        self.registry.remove(&key).await;

        match outcome {
            Ok(()) => {
                let _ = self.client.shutdown().await;
                debug!(session = key.session, client_id = key.client_id, "Relay complete");
                Ok(())
            }
            // Client socket failed; nobody left to tell.
            Err(e @ Error::Io(_)) => Err(e),
            Err(e) => {
                self.report_failure(&e).await;
                Err(e)
            }
        }
    }

    async fn relay(&mut self, key: RelayKey, request: &ComputeRequest) -> Result<()> {
        let link = BackendLink::connect(self.backend).await?;
        self.registry.insert(key, Arc::clone(&link)).await;

        let reply = link.exchange(request).await?;
        write_frame(&mut self.client, &reply).await
    }

    async fn report_failure(&mut self, err: &Error) {
        if let Err(e) = write_frame(&mut self.client, &Reply::failed(err)).await {
            trace!(session = self.session, error = %e, "Could not deliver failure reply");
        }
        let _ = self.client.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{ComputeConfig, ComputeServer};
    use crate::matrix::Matrix;
    use crate::protocol::FaultKind;
    use std::time::Duration;

    async fn start_compute() -> crate::compute::ComputeHandle {
        ComputeServer::bind(&ComputeConfig {
            listen: "127.0.0.1:0".to_string(),
            workers: 4,
        })
        .await
        .unwrap()
        .start()
        .unwrap()
    }

    async fn start_router(backend: SocketAddr, max_relays: Option<usize>) -> RouterHandle {
        Router::bind(&RouterConfig {
            listen: "127.0.0.1:0".to_string(),
            backend: backend.to_string(),
            max_relays,
        })
        .await
        .unwrap()
        .start()
        .unwrap()
    }

    async fn submit(router: SocketAddr, client_id: i32, request: ComputeRequest) -> Reply {
        let mut stream = TcpStream::connect(router).await.unwrap();
        write_frame(&mut stream, &RoutedRequest { client_id, request })
            .await
            .unwrap();
        read_frame::<Reply, _>(&mut stream).await.unwrap().unwrap()
    }

    fn request() -> ComputeRequest {
        ComputeRequest {
            a: Matrix::from_rows(vec![vec![1, 2], vec![3, 4]]).unwrap(),
            b: Matrix::from_rows(vec![vec![5, 6], vec![7, 8]]).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_relay_roundtrip() {
        let compute = start_compute().await;
        let router = start_router(compute.local_addr(), None).await;

        let result = submit(router.local_addr(), 1, request())
            .await
            .into_result()
            .unwrap();
        assert_eq!(result.product.to_rows(), vec![vec![19, 22], vec![43, 50]]);
        assert!(router.registry().is_empty());

        router.stop();
        router.join().await.unwrap();
        compute.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_forwards_backend_failure() {
        let compute = start_compute().await;
        let router = start_router(compute.local_addr(), None).await;

        let bad = ComputeRequest {
            a: Matrix::zeros(1, 2),
            b: Matrix::zeros(3, 1),
        };
        match submit(router.local_addr(), 3, bad).await {
            Reply::Failed(fault) => assert_eq!(fault.kind, FaultKind::DimensionMismatch),
            other => panic!("Expected failure reply, got {:?}", other),
        }

        router.stop();
        router.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_with_limit() {
        let compute = start_compute().await;
        let router = start_router(compute.local_addr(), Some(1)).await;
        let addr = router.local_addr();

        let replies = submit_concurrently(addr).await;
        for reply in replies {
            assert!(reply.into_result().is_ok());
        }
        assert!(router.registry().is_empty());
    }

    async fn submit_concurrently(addr: SocketAddr) -> Vec<Reply> {
        let mut handles = Vec::new();
        for id in 0..4 {
            handles.push(tokio::spawn(submit(addr, id, request())));
        }
        let mut replies = Vec::new();
        for handle in handles {
            replies.push(handle.await.unwrap());
        }
        replies
    }

    #[tokio::test]
    async fn test_stop_ends_accept_loop() {
        let compute = start_compute().await;
        let router = start_router(compute.local_addr(), None).await;
        let addr = router.local_addr();

        assert!(!router.is_stopped());
        router.stop();
        assert!(router.is_stopped());
        router.join().await.unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_rejects_zero_relay_limit() {
        let result = Router::bind(&RouterConfig {
            listen: "127.0.0.1:0".to_string(),
            backend: "127.0.0.1:9".to_string(),
            max_relays: Some(0),
        })
        .await;
        match result {
            Err(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::InvalidInput),
            Err(other) => panic!("Expected InvalidInput, got {:?}", other),
            Ok(_) => panic!("Expected a zero relay limit to be rejected"),
        }
    }

    #[tokio::test]
    async fn test_relay_limit_of_one_serves_client() {
        let compute = start_compute().await;
        let router = start_router(compute.local_addr(), Some(1)).await;

        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            submit(router.local_addr(), 1, request()),
        )
        .await
        .unwrap();
        assert!(reply.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_relay_reports_invalid_backend_reply() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let _ = read_frame::<ComputeRequest, _>(&mut stream).await;
            stream.write_all(&[0x07]).await.unwrap();
        });

        let router = start_router(backend_addr, None).await;
        match submit(router.local_addr(), 1, request()).await {
            Reply::Failed(fault) => assert_eq!(fault.kind, FaultKind::Internal),
            other => panic!("Expected failure reply, got {:?}", other),
        }
        assert!(router.registry().is_empty());
    }

    #[tokio::test]
    async fn test_bind_unresolvable_backend() {
        let result = Router::bind(&RouterConfig {
            listen: "127.0.0.1:0".to_string(),
            backend: "not an address".to_string(),
            max_relays: None,
        })
        .await;
        assert!(result.is_err());
    }
}
