//! Registry of backend connections the router has open on behalf of clients.
//!
//! Each relay worker registers the link it opened to the compute server and
//! removes it when done. Removal closes the link. The map is shared by every
//! relay task, so it is a `DashMap` rather than a lock around a `HashMap`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::connection::{read_frame, write_frame};
use crate::error::{Error, Result};
use crate::protocol::{ComputeRequest, Reply};

/// Registry key for one relay session.
///
/// `session` is assigned by the router when the relay worker is created, so
/// two clients that send the same `client_id` never share an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelayKey {
    pub session: u64,
    pub client_id: i32,
}

/// A socket to the compute server.
///
/// The stream is taken out on [`BackendLink::close`]; any exchange after that
/// fails with `BackendUnreachable`.
#[derive(Debug)]
pub struct BackendLink {
    addr: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
}

impl BackendLink {
    /// Open a new connection to `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| Error::BackendUnreachable { addr, source })?;
        stream.set_nodelay(true)?;
        Ok(Arc::new(Self {
            addr,
            stream: Mutex::new(Some(stream)),
        }))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send one request and wait for the reply.
    pub async fn exchange(&self, request: &ComputeRequest) -> Result<Reply> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| self.unreachable("link closed"))?;

        write_frame(stream, request)
            .await
            .map_err(|e| self.lost(e))?;
        match read_frame::<Reply, _>(stream).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(self.unreachable("backend closed the connection")),
            Err(e) => Err(self.lost(e)),
        }
    }

    /// Shut the socket down. Returns `false` if it was already closed.
    pub async fn close(&self) -> bool {
        let stream = self.stream.lock().await.take();
        match stream {
            Some(mut stream) => {
                if let Err(e) = stream.shutdown().await {
                    trace!(addr = %self.addr, error = %e, "Backend shutdown failed");
                }
                true
            }
            None => false,
        }
    }

    pub async fn is_open(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    fn unreachable(&self, msg: &str) -> Error {
        Error::BackendUnreachable {
            addr: self.addr,
            source: std::io::Error::new(std::io::ErrorKind::NotConnected, msg.to_string()),
        }
    }

    /// Attribute a failed exchange to the backend, never to the client.
    fn lost(&self, err: Error) -> Error {
        match err {
            Error::Io(source) => Error::BackendUnreachable {
                addr: self.addr,
                source,
            },
            Error::MalformedPayload(reason) => Error::BackendReply {
                addr: self.addr,
                reason,
            },
            other => other,
        }
    }
}

/// An entry in the registry.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub backend: Arc<BackendLink>,
    pub opened_at: Instant,
}

/// Concurrent map from relay session to its backend link.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<RelayKey, ConnectionRecord>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` under `key`.
    ///
    /// An existing entry for the same key is replaced and its link closed.
    pub async fn insert(&self, key: RelayKey, backend: Arc<BackendLink>) {
        let record = ConnectionRecord {
            backend,
            opened_at: Instant::now(),
        };
        let displaced = self.connections.insert(key, record);
        debug!(session = key.session, client_id = key.client_id, "Registered backend link");

        if let Some(old) = displaced {
            old.backend.close().await;
        }
    }

    /// Remove the entry for `key` and close its link.
    ///
    /// Removing an absent key is a no-op and returns `false`.
    pub async fn remove(&self, key: &RelayKey) -> bool {
        let Some((_, record)) = self.connections.remove(key) else {
            trace!(session = key.session, "Remove of unknown relay session");
            return false;
        };
        record.backend.close().await;
        debug!(
            session = key.session,
            client_id = key.client_id,
            held_ms = record.opened_at.elapsed().as_millis() as u64,
            "Unregistered backend link"
        );
        true
    }

    /// Look up the link registered under `key`.
    pub fn get(&self, key: &RelayKey) -> Option<Arc<BackendLink>> {
        self.connections
            .get(key)
            .map(|record| Arc::clone(&record.backend))
    }

    pub fn contains(&self, key: &RelayKey) -> bool {
        self.connections.contains_key(key)
    }

    /// All sessions currently registered for `client_id`.
    pub fn sessions_for(&self, client_id: i32) -> Vec<RelayKey> {
        self.connections
            .iter()
            .map(|entry| *entry.key())
            .filter(|key| key.client_id == client_id)
            .collect()
    }

    /// Snapshot of every registered key, in no particular order.
    pub fn keys(&self) -> Vec<RelayKey> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
