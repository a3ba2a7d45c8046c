//! Error types shared by the engine, the compute server and the router.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::FaultKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("matrix dimension mismatch: A is {a_rows}x{a_cols}, B is {b_rows}x{b_cols}")]
    DimensionMismatch {
        a_rows: usize,
        a_cols: usize,
        b_rows: usize,
        b_cols: usize,
    },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("backend {addr} unreachable: {source}")]
    BackendUnreachable {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("backend {addr} sent an invalid reply: {reason}")]
    BackendReply { addr: SocketAddr, reason: String },

    #[error("peer reported {kind}: {message}")]
    Remote { kind: FaultKind, message: String },

    #[error("sessions still running after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedPayload(msg.into())
    }

    /// Wire classification used when this error is reported back to a peer.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Error::DimensionMismatch { .. } => FaultKind::DimensionMismatch,
            Error::MalformedPayload(_) => FaultKind::MalformedPayload,
            Error::BackendUnreachable { .. } => FaultKind::BackendUnreachable,
            Error::Remote { kind, .. } => *kind,
            _ => FaultKind::Internal,
        }
    }
}
