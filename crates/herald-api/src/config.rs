//! Configuration management for the Herald service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use herald_core::storage::StoreConfig;
use herald_delivery::{ClientConfig, PipelineConfig, RedeliveryPolicy};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "herald.toml";

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process maps; state is lost on restart.
    Memory,
    /// PostgreSQL via `DATABASE_URL`.
    Postgres,
}

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`herald.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use herald_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// HTTP request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Storage
    /// Storage backend.
    ///
    /// Environment variable: `STORAGE_BACKEND`
    #[serde(default = "default_backend", alias = "STORAGE_BACKEND")]
    pub storage_backend: StorageBackend,
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Maximum subscriptions per partition. Fixed for the life of the data.
    ///
    /// Environment variable: `PARTITION_LIMIT`
    #[serde(default = "default_partition_limit", alias = "PARTITION_LIMIT")]
    pub partition_limit: u32,

    // Pipeline
    /// Concurrent pushes while fanning out to partitions.
    ///
    /// Environment variable: `PARTITION_CONCURRENCY`
    #[serde(default = "default_fanout_concurrency", alias = "PARTITION_CONCURRENCY")]
    pub partition_concurrency: usize,
    /// Concurrent pushes while fanning out to subscriptions.
    ///
    /// Environment variable: `SPREAD_CONCURRENCY`
    #[serde(default = "default_fanout_concurrency", alias = "SPREAD_CONCURRENCY")]
    pub spread_concurrency: usize,
    /// Partition stage workers.
    ///
    /// Environment variable: `PARTITION_WORKERS`
    #[serde(default = "default_stage_workers", alias = "PARTITION_WORKERS")]
    pub partition_workers: usize,
    /// Spread stage workers.
    ///
    /// Environment variable: `SPREAD_WORKERS`
    #[serde(default = "default_stage_workers", alias = "SPREAD_WORKERS")]
    pub spread_workers: usize,
    /// Delivery stage workers.
    ///
    /// Environment variable: `DELIVERY_WORKERS`
    #[serde(default = "default_delivery_workers", alias = "DELIVERY_WORKERS")]
    pub delivery_workers: usize,
    /// Deadline for one stage invocation in seconds.
    ///
    /// Environment variable: `STAGE_DEADLINE_SECONDS`
    #[serde(default = "default_stage_deadline", alias = "STAGE_DEADLINE_SECONDS")]
    pub stage_deadline_seconds: u64,
    /// Maximum messages held by each stage queue.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[serde(default = "default_queue_capacity", alias = "QUEUE_CAPACITY")]
    pub queue_capacity: usize,
    /// Seconds to wait for in-flight messages on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Redelivery
    /// Handling attempts per stage message.
    ///
    /// Environment variable: `REDELIVERY_MAX_ATTEMPTS`
    #[serde(default = "default_redelivery_attempts", alias = "REDELIVERY_MAX_ATTEMPTS")]
    pub redelivery_max_attempts: u32,
    /// Base redelivery delay in milliseconds.
    ///
    /// Environment variable: `REDELIVERY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "REDELIVERY_BASE_DELAY_MS")]
    pub redelivery_base_delay_ms: u64,
    /// Maximum redelivery delay in milliseconds.
    ///
    /// Environment variable: `REDELIVERY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "REDELIVERY_MAX_DELAY_MS")]
    pub redelivery_max_delay_ms: u64,

    // Client
    /// HTTP timeout for webhook callbacks in seconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout", alias = "DELIVERY_TIMEOUT_SECONDS")]
    pub delivery_timeout_seconds: u64,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or a value fails
    /// validation.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the pipeline engine configuration.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            partition_workers: self.partition_workers,
            spread_workers: self.spread_workers,
            delivery_workers: self.delivery_workers,
            partition_concurrency: self.partition_concurrency,
            spread_concurrency: self.spread_concurrency,
            stage_deadline: Duration::from_secs(self.stage_deadline_seconds),
            queue_capacity: self.queue_capacity,
            redelivery: self.to_redelivery_policy(),
            client_config: self.to_client_config(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// Convert to client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    /// Convert to the queue redelivery policy.
    pub fn to_redelivery_policy(&self) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_attempts: self.redelivery_max_attempts,
            base_delay: Duration::from_millis(self.redelivery_base_delay_ms),
            max_delay: Duration::from_millis(self.redelivery_max_delay_ms),
            ..RedeliveryPolicy::default()
        }
    }

    /// Convert to storage settings.
    pub fn to_store_config(&self) -> StoreConfig {
        StoreConfig { partition_limit: self.partition_limit }
    }

    /// Parse server socket address from host and port configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.storage_backend == StorageBackend::Postgres && self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        // Each delivery worker keeps a connection for the whole callback.
        if self.storage_backend == StorageBackend::Postgres
            && self.database_max_connections as usize <= self.delivery_workers
        {
            anyhow::bail!(
                "database_max_connections ({}) must exceed delivery_workers ({})",
                self.database_max_connections,
                self.delivery_workers
            );
        }

        if self.partition_limit == 0 {
            anyhow::bail!("partition_limit must be greater than 0");
        }

        if self.partition_concurrency == 0 || self.spread_concurrency == 0 {
            anyhow::bail!("fan-out concurrency must be greater than 0");
        }

        if self.partition_workers == 0 || self.spread_workers == 0 || self.delivery_workers == 0 {
            anyhow::bail!("every stage needs at least one worker");
        }

        if self.stage_deadline_seconds == 0 {
            anyhow::bail!("stage_deadline_seconds must be greater than 0");
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than 0");
        }

        if self.redelivery_max_attempts == 0 {
            anyhow::bail!("redelivery_max_attempts must be greater than 0");
        }

        if self.redelivery_base_delay_ms > self.redelivery_max_delay_ms {
            anyhow::bail!("redelivery_base_delay_ms cannot exceed redelivery_max_delay_ms");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            storage_backend: default_backend(),
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            partition_limit: default_partition_limit(),
            partition_concurrency: default_fanout_concurrency(),
            spread_concurrency: default_fanout_concurrency(),
            partition_workers: default_stage_workers(),
            spread_workers: default_stage_workers(),
            delivery_workers: default_delivery_workers(),
            stage_deadline_seconds: default_stage_deadline(),
            queue_capacity: default_queue_capacity(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            redelivery_max_attempts: default_redelivery_attempts(),
            redelivery_base_delay_ms: default_base_delay_ms(),
            redelivery_max_delay_ms: default_max_delay_ms(),
            delivery_timeout_seconds: default_delivery_timeout(),
            rust_log: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_backend() -> StorageBackend {
    StorageBackend::Memory
}

fn default_database_url() -> String {
    "postgresql://localhost/herald".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_partition_limit() -> u32 {
    StoreConfig::default().partition_limit
}

fn default_fanout_concurrency() -> usize {
    herald_delivery::DEFAULT_FANOUT_CONCURRENCY
}

fn default_stage_workers() -> usize {
    herald_delivery::DEFAULT_WORKER_COUNT
}

fn default_delivery_workers() -> usize {
    herald_delivery::DEFAULT_WORKER_COUNT * 4
}

fn default_stage_deadline() -> u64 {
    herald_delivery::DEFAULT_STAGE_DEADLINE_SECONDS
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_redelivery_attempts() -> u32 {
    8
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_delivery_timeout() -> u64 {
    herald_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_log_level() -> String {
    "info,herald=debug,tower_http=debug".to_string()
}
