//! Configuration module for matrix-relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::compute::{ComputeConfig, MAX_WORKERS};
use crate::router::RouterConfig;

/// Command-line arguments for the relay demo
#[derive(Parser, Debug)]
#[command(name = "matrix-relay")]
#[command(author = "matrix-relay authors")]
#[command(version = "0.1.0")]
#[command(
    about = "Relays matrix multiplication requests through a router to a compute server",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Router address to bind to (e.g., 127.0.0.1:12345)
    #[arg(long)]
    pub router_listen: Option<String>,

    /// Compute server address to bind to (e.g., 127.0.0.1:12346)
    #[arg(long)]
    pub compute_listen: Option<String>,

    /// Maximum concurrent relays on the router (unbounded if unset)
    #[arg(long)]
    pub max_relays: Option<usize>,

    /// Compute session pool size (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Number of concurrent clients to launch
    #[arg(short = 'n', long)]
    pub clients: Option<usize>,

    /// Side length of the random square matrices each client sends
    #[arg(short = 's', long)]
    pub matrix_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub compute: ComputeSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Router-related configuration
#[derive(Debug, Deserialize)]
pub struct RouterSection {
    /// Address to bind to
    #[serde(default = "default_router_listen")]
    pub listen: String,
    /// Maximum concurrent relays
    pub max_relays: Option<usize>,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            listen: default_router_listen(),
            max_relays: None,
        }
    }
}

/// Compute server configuration
#[derive(Debug, Deserialize)]
pub struct ComputeSection {
    /// Address to bind to
    #[serde(default = "default_compute_listen")]
    pub listen: String,
    /// Session pool size (0 = number of CPU cores)
    #[serde(default)]
    pub workers: usize,
    /// Seconds to wait for in-flight sessions on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ComputeSection {
    fn default() -> Self {
        Self {
            listen: default_compute_listen(),
            workers: 0,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Client fan-out configuration
#[derive(Debug, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_clients")]
    pub clients: usize,
    #[serde(default = "default_matrix_size")]
    pub matrix_size: usize,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            clients: default_clients(),
            matrix_size: default_matrix_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_router_listen() -> String {
    "127.0.0.1:12345".to_string()
}

fn default_compute_listen() -> String {
    "127.0.0.1:12346".to_string()
}

fn default_shutdown_timeout() -> u64 {
    60
}

fn default_clients() -> usize {
    4
}

fn default_matrix_size() -> usize {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub router_listen: String,
    pub max_relays: Option<usize>,
    pub compute_listen: String,
    pub workers: usize,
    pub shutdown_timeout: u64,
    pub clients: usize,
    pub matrix_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::parse_from(["matrix-relay"]), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the servers cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_relays == Some(0) {
            return Err(ConfigError::InvalidValue(
                "max_relays",
                "must be at least 1 (leave unset for no limit)".to_string(),
            ));
        }
        if self.workers > MAX_WORKERS {
            return Err(ConfigError::InvalidValue(
                "workers",
                format!("must be at most {}, got {}", MAX_WORKERS, self.workers),
            ));
        }
        Ok(())
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            router_listen: cli.router_listen.unwrap_or(toml_config.router.listen),
            max_relays: cli.max_relays.or(toml_config.router.max_relays),
            compute_listen: cli.compute_listen.unwrap_or(toml_config.compute.listen),
            workers: cli.workers.unwrap_or(toml_config.compute.workers),
            shutdown_timeout: toml_config.compute.shutdown_timeout,
            clients: cli.clients.unwrap_or(toml_config.supervisor.clients),
            matrix_size: cli
                .matrix_size
                .unwrap_or(toml_config.supervisor.matrix_size),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Router settings, forwarding to the compute server at `backend`.
    pub fn router(&self, backend: impl Into<String>) -> RouterConfig {
        RouterConfig {
            listen: self.router_listen.clone(),
            backend: backend.into(),
            max_relays: self.max_relays,
        }
    }

    pub fn compute(&self) -> ComputeConfig {
        ComputeConfig {
            listen: self.compute_listen.clone(),
            workers: self.workers,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.router.listen, "127.0.0.1:12345");
        assert_eq!(config.compute.listen, "127.0.0.1:12346");
        assert_eq!(config.compute.workers, 0);
        assert_eq!(config.compute.shutdown_timeout, 60);
        assert_eq!(config.supervisor.clients, 4);
        assert_eq!(config.supervisor.matrix_size, 20);
        assert!(config.router.max_relays.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [router]
            listen = "0.0.0.0:2000"
            max_relays = 64

            [compute]
            listen = "0.0.0.0:2001"
            workers = 4
            shutdown_timeout = 5

            [supervisor]
            clients = 8
            matrix_size = 33

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.router.listen, "0.0.0.0:2000");
        assert_eq!(config.router.max_relays, Some(64));
        assert_eq!(config.compute.workers, 4);
        assert_eq!(config.compute.shutdown_timeout, 5);
        assert_eq!(config.supervisor.clients, 8);
        assert_eq!(config.supervisor.matrix_size, 33);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::parse_from([
            "matrix-relay",
            "--router-listen",
            "127.0.0.1:0",
            "-n",
            "2",
            "--log-level",
            "debug",
        ]);
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [router]
            listen = "0.0.0.0:2000"
            [supervisor]
            clients = 8
            matrix_size = 5
        "#,
        )
        .unwrap();

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.router_listen, "127.0.0.1:0");
        assert_eq!(config.clients, 2);
        assert_eq!(config.matrix_size, 5);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.router("127.0.0.1:9").backend, "127.0.0.1:9");
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs::parse_from(["matrix-relay", "-c", "/nonexistent/relay.toml"]);
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::FileRead(..))
        ));
    }

    #[test]
    fn test_zero_max_relays_rejected() {
        let cli = CliArgs::parse_from(["matrix-relay", "--max-relays", "0"]);
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::InvalidValue("max_relays", _))
        ));

        let cli = CliArgs::parse_from(["matrix-relay", "--max-relays", "1"]);
        assert_eq!(Config::from_args(cli).unwrap().max_relays, Some(1));
    }

    #[test]
    fn test_zero_max_relays_in_file_rejected() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [router]
            max_relays = 0
        "#,
        )
        .unwrap();
        let config = Config::merge(CliArgs::parse_from(["matrix-relay"]), toml_config);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue("max_relays", _))
        ));
    }

    #[test]
    fn test_oversized_workers_rejected() {
        let workers = (MAX_WORKERS + 1).to_string();
        let cli = CliArgs::parse_from(["matrix-relay", "-w", workers.as_str()]);
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::InvalidValue("workers", _))
        ));
    }

    #[test]
    fn test_default_resolved_config() {
        let config = Config::default();
        assert_eq!(config.router_listen, "127.0.0.1:12345");
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(60));
        assert_eq!(config.compute().workers, 0);
    }
}
