//! Application configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/bif";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default directory receiving provisional and final interface files.
pub const DEFAULT_OUTPUT_DIR: &str = "./output";

/// Default directory holding `*.toml` interface definitions.
pub const DEFAULT_INTERFACE_DIR: &str = "./interfaces";

/// Default number of jobs executing concurrently.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;

/// Default number of attempts for a status update losing a version race.
pub const DEFAULT_STATUS_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub interface_dir: PathBuf,
    pub worker_pool_size: usize,
    pub status_retry_attempts: u32,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = AppConfig {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            pipeline: PipelineConfig {
                output_dir: std::env::var("BIF_OUTPUT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_OUTPUT_DIR)),
                interface_dir: std::env::var("BIF_INTERFACE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_INTERFACE_DIR)),
                worker_pool_size: env_or("BIF_WORKER_POOL_SIZE", DEFAULT_WORKER_POOL_SIZE),
                status_retry_attempts: env_or(
                    "BIF_STATUS_RETRY_ATTEMPTS",
                    DEFAULT_STATUS_RETRY_ATTEMPTS,
                ),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        // Each running job holds one connection while paging
        if self.pipeline.worker_pool_size == 0 {
            anyhow::bail!("Worker pool size must be greater than 0");
        }

        if self.pipeline.worker_pool_size as u32 > self.database.max_connections {
            tracing::warn!(
                worker_pool_size = self.pipeline.worker_pool_size,
                max_connections = self.database.max_connections,
                "Worker pool is larger than the connection pool; jobs will wait for connections"
            );
        }

        if self.pipeline.status_retry_attempts == 0 {
            anyhow::bail!("Status retry attempts must be at least 1");
        }

        if self.pipeline.output_dir.as_os_str().is_empty() {
            anyhow::bail!("Output directory cannot be empty");
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            pipeline: PipelineConfig {
                output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
                interface_dir: PathBuf::from(DEFAULT_INTERFACE_DIR),
                worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
                status_retry_attempts: DEFAULT_STATUS_RETRY_ATTEMPTS,
            },
        }
    }
}
