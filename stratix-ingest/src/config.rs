//! Configuration resolution for stratix-ingest
//!
//! **Priority:** CLI argument → environment (`STRATIX_*`) → TOML file → default
//!
//! The object storage token is a secret and is read from
//! `STRATIX_STORAGE_TOKEN` only; it is never taken from the TOML file and
//! never serialized back out.

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use stratix_common::config::{default_data_dir, load_toml_or_default, resolve_config_path, LoggingConfig};
use stratix_common::{Error, Result};
use tracing::info;

use crate::services::{BreakerConfig, PipelineSettings, RetryPolicy};

/// Environment variable holding the object storage bearer token
pub const STORAGE_TOKEN_ENV: &str = "STRATIX_STORAGE_TOKEN";

/// Command-line arguments for stratix-ingest
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "stratix-ingest")]
#[command(about = "Bulk import service for Stratix OKR tenants")]
#[command(version)]
pub struct Args {
    /// TOML config file
    #[arg(short, long, env = "STRATIX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind the HTTP server to
    #[arg(long, env = "STRATIX_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "STRATIX_PORT")]
    pub port: Option<u16>,

    /// SQLite database file or `sqlite:` URL
    #[arg(long, env = "STRATIX_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Object storage backend
    #[arg(long, env = "STRATIX_STORAGE_BACKEND", value_enum)]
    pub storage_backend: Option<StorageBackend>,

    /// Root directory of the filesystem backend
    #[arg(long, env = "STRATIX_STORAGE_ROOT")]
    pub storage_root: Option<PathBuf>,

    /// Base URL of the HTTP backend
    #[arg(long, env = "STRATIX_STORAGE_URL")]
    pub storage_url: Option<String>,

    /// Bucket of the HTTP backend
    #[arg(long, env = "STRATIX_STORAGE_BUCKET")]
    pub storage_bucket: Option<String>,

    /// Maximum records per batch
    #[arg(long, env = "STRATIX_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Jobs processed at the same time
    #[arg(long, env = "STRATIX_MAX_CONCURRENT_JOBS")]
    pub max_concurrent_jobs: Option<usize>,

    /// Log filter directive (overridden by RUST_LOG)
    #[arg(long, env = "STRATIX_LOG")]
    pub log_level: Option<String>,
}

/// Where raw uploads are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Filesystem,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { max_connections: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Filesystem backend root (default: `<data dir>/objects`)
    pub root: Option<PathBuf>,
    pub base_url: Option<String>,
    pub bucket: String,
    pub request_timeout_ms: u64,
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Filesystem,
            root: None,
            base_url: None,
            bucket: "imports".to_string(),
            request_timeout_ms: 10_000,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImportConfig {
    pub batch_size: usize,
    pub queue_capacity: usize,
    pub writer_concurrency: usize,
    pub max_concurrent_jobs: usize,
    pub max_upload_bytes: usize,
    pub progress_capacity: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            queue_capacity: 4,
            writer_concurrency: 4,
            max_concurrent_jobs: 2,
            max_upload_bytes: 50 * 1024 * 1024,
            progress_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cool_down_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            probe_timeout_ms: 2_000,
        }
    }
}

/// Fully resolved service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub bind_address: String,
    pub port: u16,
    /// Database file or URL (default: `<data dir>/stratix-ingest.db`)
    pub database_url: Option<String>,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub import: ImportConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 5790,
            database_url: None,
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            import: ImportConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig {
                level: "stratix_ingest=info,tower_http=info".to_string(),
            },
        }
    }
}

impl IngestConfig {
    /// Merge all configuration tiers and validate the result
    pub fn resolve(args: &Args) -> Result<Self> {
        let path = resolve_config_path("ingest", args.config.as_deref(), "STRATIX_CONFIG");
        let mut config: IngestConfig = load_toml_or_default(path.as_deref())?;
        config.apply_overrides(args);
        config.storage.token = std::env::var(STORAGE_TOKEN_ENV)
            .ok()
            .filter(|token| !token.trim().is_empty());
        config.validate()?;

        info!(
            port = config.port,
            storage = ?config.storage.backend,
            batch_size = config.import.batch_size,
            max_concurrent_jobs = config.import.max_concurrent_jobs,
            "Configuration resolved"
        );
        Ok(config)
    }

    /// Apply command-line / environment values over the file values
    pub fn apply_overrides(&mut self, args: &Args) {
        if let Some(bind_address) = &args.bind_address {
            self.bind_address = bind_address.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(database_url) = &args.database_url {
            self.database_url = Some(database_url.clone());
        }
        if let Some(backend) = args.storage_backend {
            self.storage.backend = backend;
        }
        if let Some(root) = &args.storage_root {
            self.storage.root = Some(root.clone());
        }
        if let Some(url) = &args.storage_url {
            self.storage.base_url = Some(url.clone());
        }
        if let Some(bucket) = &args.storage_bucket {
            self.storage.bucket = bucket.clone();
        }
        if let Some(batch_size) = args.batch_size {
            self.import.batch_size = batch_size;
        }
        if let Some(jobs) = args.max_concurrent_jobs {
            self.import.max_concurrent_jobs = jobs;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("import.batch_size", self.import.batch_size),
            ("import.queue_capacity", self.import.queue_capacity),
            ("import.writer_concurrency", self.import.writer_concurrency),
            ("import.max_concurrent_jobs", self.import.max_concurrent_jobs),
            ("import.max_upload_bytes", self.import.max_upload_bytes),
            ("import.progress_capacity", self.import.progress_capacity),
            ("database.max_connections", self.database.max_connections as usize),
            ("circuit_breaker.failure_threshold", self.circuit_breaker.failure_threshold as usize),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{} must be greater than zero", name)));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        if self.health.poll_interval_ms == 0 || self.health.probe_timeout_ms == 0 {
            return Err(Error::Config(
                "health intervals must be greater than zero".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::Http && self.storage.base_url.is_none() {
            return Err(Error::Config(
                "storage.base_url is required for the http backend".to_string(),
            ));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid bind address {}:{}: {}", self.bind_address, self.port, e)))
    }

    pub fn database_location(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => default_data_dir()
                .join("stratix-ingest.db")
                .to_string_lossy()
                .into_owned(),
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        self.storage
            .root
            .clone()
            .unwrap_or_else(|| default_data_dir().join("objects"))
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            batch_size: self.import.batch_size,
            queue_capacity: self.import.queue_capacity,
            writer_concurrency: self.import.writer_concurrency,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            cool_down: Duration::from_millis(self.circuit_breaker.cool_down_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.health.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health.probe_timeout_ms)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.request_timeout_ms)
    }
}
