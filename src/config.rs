use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::clock::Timezone;
use crate::policy::ErrorPolicy;
use crate::queue::buffer::DRAINING_SUFFIX;

/// Top-level configuration for viewtally.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// What the write paths do with a failure. Default: log_and_continue.
    #[serde(default)]
    pub error_policy: ErrorPolicy,

    /// Time zone that decides the date of aggregate rows. Default: local.
    #[serde(default)]
    pub timezone: Timezone,

    /// Counter buffer configuration.
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Persistent aggregate store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Flush scheduling configuration.
    #[serde(default)]
    pub flush: FlushConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Counter buffer backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferBackendKind {
    /// In-process buffer. Only useful when writers share the process.
    Memory,
    #[default]
    Redis,
}

/// Counter buffer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Backend to use. Default: redis.
    #[serde(default)]
    pub backend: BufferBackendKind,

    /// Redis URL. Falls back to VIEWTALLY_REDIS_URL, then REDIS_URL,
    /// then redis://localhost.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Per-call timeout for buffer operations. Default: 2s.
    #[serde(default = "default_buffer_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Live buffer name for page views.
    #[serde(default = "default_page_queue")]
    pub page_queue: String,

    /// Live buffer name for browser identities.
    #[serde(default = "default_browser_queue")]
    pub browser_queue: String,

    /// Entries requested per scan page during a flush. Default: 500.
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
}

/// Aggregate store backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendKind {
    #[default]
    Sqlite,
    #[serde(rename = "clickhouse")]
    ClickHouse,
}

/// Persistent aggregate store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Backend to use. Default: sqlite.
    #[serde(default)]
    pub backend: StoreBackendKind,

    /// Create the aggregate tables on startup if missing. Default: true.
    #[serde(default = "default_true")]
    pub create_tables: bool,

    #[serde(default)]
    pub sqlite: SqliteConfig,

    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

/// SQLite store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Database file path, or ":memory:". Default: "viewtally.db".
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Native protocol endpoint (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// Username for authentication.
    #[serde(default)]
    pub username: String,

    /// Password for authentication.
    #[serde(default)]
    pub password: String,
}

/// Flush scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FlushConfig {
    /// Time between flush cycles. Default: 60s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_buffer_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_page_queue() -> String {
    "viewtally:page_queue".to_string()
}

fn default_browser_queue() -> String {
    "viewtally:browser_queue".to_string()
}

fn default_scan_count() -> usize {
    500
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("viewtally.db")
}

fn default_database() -> String {
    "default".to_string()
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            error_policy: ErrorPolicy::default(),
            timezone: Timezone::default(),
            buffer: BufferConfig::default(),
            store: StoreConfig::default(),
            flush: FlushConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            backend: BufferBackendKind::default(),
            redis_url: None,
            timeout: default_buffer_timeout(),
            page_queue: default_page_queue(),
            browser_queue: default_browser_queue(),
            scan_count: default_scan_count(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::default(),
            create_tables: true,
            sqlite: SqliteConfig::default(),
            clickhouse: ClickHouseConfig::default(),
        }
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: default_flush_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        self.buffer.validate().context("invalid buffer config")?;
        self.store.validate().context("invalid store config")?;

        if self.flush.interval.is_zero() {
            bail!("flush.interval must be positive");
        }

        Ok(())
    }
}

impl BufferConfig {
    fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            bail!("buffer.timeout must be positive");
        }

        if self.scan_count == 0 {
            bail!("buffer.scan_count must be positive");
        }

        for (field, name) in [
            ("page_queue", &self.page_queue),
            ("browser_queue", &self.browser_queue),
        ] {
            if name.is_empty() {
                bail!("buffer.{field} is required");
            }
            if name.contains(DRAINING_SUFFIX) {
                bail!("buffer.{field} must not contain {DRAINING_SUFFIX}");
            }
        }

        if self.page_queue == self.browser_queue {
            bail!("buffer.page_queue and buffer.browser_queue must differ");
        }

        if matches!(self.redis_url.as_deref(), Some("")) {
            bail!("buffer.redis_url must not be empty when set");
        }

        Ok(())
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        match self.backend {
            StoreBackendKind::Sqlite => {
                if self.sqlite.path.as_os_str().is_empty() {
                    bail!("store.sqlite.path is required");
                }
            }
            StoreBackendKind::ClickHouse => {
                if self.clickhouse.endpoint.is_empty() {
                    bail!("store.clickhouse.endpoint is required");
                }
                if self.clickhouse.database.is_empty() {
                    bail!("store.clickhouse.database is required");
                }
            }
        }

        Ok(())
    }
}
