use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::model::RecordKind;
use crate::tenant::TENANT_ID_PLACEHOLDER;

/// Top-level configuration for the ingestion service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// ClickHouse storage configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Multi-tenancy configuration.
    #[serde(default)]
    pub tenancy: TenancyConfig,

    /// Client-latency metric generation.
    #[serde(default)]
    pub client_metric: ClientMetricConfig,

    /// Profiling signal collection.
    #[serde(default)]
    pub signal: SignalConfig,

    /// Prepared statement cache.
    #[serde(default)]
    pub statement_cache: StatementCacheConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// ClickHouse connection and table configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Database used when multi-tenancy is disabled. Default: "apo".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Cluster name for `ON CLUSTER` DDL and distributed tables.
    #[serde(default)]
    pub cluster: Option<String>,

    /// Time between flushes. Zero falls back to the default. Default: 5s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Default table TTL in days. Default: 7.
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,

    /// Per-table TTL overrides.
    #[serde(default)]
    pub ttl: Vec<TtlOverride>,

    /// Per-table sharding hash overrides.
    #[serde(default)]
    pub hash: Vec<HashOverride>,

    /// Explicit tenant id to database mapping.
    #[serde(default)]
    pub tenant_db_map: HashMap<String, String>,

    /// Database name pattern containing `{TENANT_ID}`.
    #[serde(default)]
    pub tenant_db_pattern: String,

    /// Write service_client rows derived from relations. Default: false.
    #[serde(default)]
    pub export_service_client: bool,
}

/// TTL override for a group of tables.
#[derive(Debug, Clone, Deserialize)]
pub struct TtlOverride {
    pub tables: Vec<String>,
    pub ttl_days: u32,
}

/// Sharding hash override for a group of tables.
#[derive(Debug, Clone, Deserialize)]
pub struct HashOverride {
    pub tables: Vec<String>,
    pub hash: String,
}

/// Resolved per-table settings used during database initialisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSettings {
    pub ttl_days: u32,
    pub hash: Option<String>,
}

/// Multi-tenancy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TenancyConfig {
    /// Route records into per-tenant databases. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Capacity of the trace id to tenant cache. Default: 10000.
    #[serde(default = "default_trace_cache_size")]
    pub trace_cache_size: u64,
}

/// Client-latency metric configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientMetricConfig {
    /// Generate client latency histograms from relations. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Include the entry url as a label. Default: false.
    #[serde(default)]
    pub with_url: bool,
}

/// Profiling signal configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalConfig {
    /// How often slow-report counters are drained into metrics. Default: 1m.
    #[serde(default = "default_collect_interval", with = "humantime_serde")]
    pub collect_interval: Duration,
}

/// Prepared statement cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StatementCacheConfig {
    /// Idle time after which a statement is closed. Also the sweep period.
    /// Default: 5m.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
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

fn default_database() -> String {
    "apo".to_string()
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_ttl_days() -> u32 {
    7
}

fn default_trace_cache_size() -> u64 {
    10_000
}

fn default_collect_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            clickhouse: ClickHouseConfig::default(),
            tenancy: TenancyConfig::default(),
            client_metric: ClientMetricConfig::default(),
            signal: SignalConfig::default(),
            statement_cache: StatementCacheConfig::default(),
            health: HealthConfig::default(),
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
            cluster: None,
            flush_interval: default_flush_interval(),
            ttl_days: default_ttl_days(),
            ttl: Vec::new(),
            hash: Vec::new(),
            tenant_db_map: HashMap::new(),
            tenant_db_pattern: String::new(),
            export_service_client: false,
        }
    }
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trace_cache_size: default_trace_cache_size(),
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            collect_interval: default_collect_interval(),
        }
    }
}

impl Default for StatementCacheConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
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
        let ch = &self.clickhouse;

        if ch.endpoint.is_empty() {
            bail!("clickhouse.endpoint is required");
        }

        if ch.database.is_empty() {
            bail!("clickhouse.database must not be empty");
        }

        if ch.ttl_days == 0 {
            bail!("clickhouse.ttl_days must be positive");
        }

        let mut ttl_tables = HashSet::new();
        for ttl in &ch.ttl {
            if ttl.ttl_days == 0 {
                bail!("ttl override for {:?} must be positive", ttl.tables);
            }
            for table in &ttl.tables {
                if RecordKind::from_table_name(table).is_none() {
                    bail!("unknown table in ttl override: {table}");
                }
                if !ttl_tables.insert(table.as_str()) {
                    bail!("table appears in more than one ttl override: {table}");
                }
            }
        }

        for hash in &ch.hash {
            if hash.hash.trim().is_empty() {
                bail!("hash override for {:?} must not be empty", hash.tables);
            }
            for table in &hash.tables {
                if RecordKind::from_table_name(table).is_none() {
                    bail!("unknown table in hash override: {table}");
                }
            }
        }

        if !ch.tenant_db_pattern.is_empty() && !ch.tenant_db_pattern.contains(TENANT_ID_PLACEHOLDER) {
            bail!("clickhouse.tenant_db_pattern must contain {TENANT_ID_PLACEHOLDER}");
        }

        if self.tenancy.trace_cache_size == 0 {
            bail!("tenancy.trace_cache_size must be positive");
        }

        if self.signal.collect_interval.is_zero() {
            bail!("signal.collect_interval must be positive");
        }

        if self.statement_cache.idle_timeout.is_zero() {
            bail!("statement_cache.idle_timeout must be positive");
        }

        Ok(())
    }
}

impl ClickHouseConfig {
    /// Flush period, substituting the default for a zero value.
    pub fn effective_flush_interval(&self) -> Duration {
        if self.flush_interval.is_zero() {
            default_flush_interval()
        } else {
            self.flush_interval
        }
    }

    /// Resolve TTL and hash settings for one table. Later overrides win.
    pub fn table_settings(&self, table: &str) -> TableSettings {
        let ttl_days = self
            .ttl
            .iter()
            .rev()
            .find(|o| o.tables.iter().any(|t| t == table))
            .map_or(self.ttl_days, |o| o.ttl_days);

        let hash = self
            .hash
            .iter()
            .rev()
            .find(|o| o.tables.iter().any(|t| t == table))
            .map(|o| o.hash.clone());

        TableSettings { ttl_days, hash }
    }
}
