//! matrix-relay: a two-hop request relay in front of a matrix multiplication
//! server.
//!
//! Clients send a pair of integer matrices to the [`router`], which opens a
//! connection to the [`compute`] server for each client, tracks it in a
//! [`registry::ConnectionRegistry`], forwards the request and relays the
//! product back. The compute server multiplies with a padded seven-product
//! recursion ([`engine`]) and reports how it compares to the direct triple
//! loop ([`metrics`]).
//!
//! Features:
//! - Binary length-prefixed wire protocol with explicit failure replies
//! - Bounded compute session pool, optional bound on concurrent relays
//! - Cooperative router stop and timed compute server shutdown
//! - Configuration via CLI arguments or TOML file
//!
//! ```no_run
//! use matrix_relay::client::Client;
//! use matrix_relay::matrix::Matrix;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new("127.0.0.1:12345");
//!     let a = Matrix::from_rows(vec![vec![1, 2], vec![3, 4]])?;
//!     let b = Matrix::from_rows(vec![vec![5, 6], vec![7, 8]])?;
//!
//!     let result = client.submit(1, a, b).await?;
//!     assert_eq!(result.product.to_rows(), vec![vec![19, 22], vec![43, 50]]);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod compute;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod matrix;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod supervisor;

pub use error::{Error, Result};
