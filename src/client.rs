//! Client side of a routed session.

use rand::Rng;
use tokio::net::TcpStream;
use tracing::debug;

use crate::connection::{read_frame, write_frame};
use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::protocol::{ComputeRequest, ComputeResult, Reply, RoutedRequest};

/// Submits matrix pairs to a router, one connection per submission.
#[derive(Debug, Clone)]
pub struct Client {
    router: String,
}

impl Client {
    pub fn new(router: impl Into<String>) -> Self {
        Self {
            router: router.into(),
        }
    }

    /// Send `a` and `b` under `client_id` and wait for the product.
    ///
    /// A failure reply from the router or compute server becomes
    /// [`Error::Remote`]; a connection that closes without replying is an
    /// I/O error.
    pub async fn submit(&self, client_id: i32, a: Matrix, b: Matrix) -> Result<ComputeResult> {
        let mut stream = TcpStream::connect(&self.router).await?;
        stream.set_nodelay(true)?;

        let routed = RoutedRequest {
            client_id,
            request: ComputeRequest { a, b },
        };
        write_frame(&mut stream, &routed).await?;

        let reply = read_frame::<Reply, _>(&mut stream).await?.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "router closed the connection without replying",
            ))
        })?;

        let result = reply.into_result()?;
        debug!(
            client_id,
            execution_time_ns = result.metrics.execution_time_ns,
            speed_up = result.metrics.speed_up,
            efficiency = result.metrics.efficiency,
            "Received product"
        );
        Ok(result)
    }
}

/// A `size x size` matrix of integers in `0..10`.
pub fn random_matrix<R: Rng + ?Sized>(size: usize, rng: &mut R) -> Matrix {
    let mut m = Matrix::zeros(size, size);
    for i in 0..size {
        for j in 0..size {
            m.set(i, j, rng.gen_range(0..10));
        }
    }
    m
}
