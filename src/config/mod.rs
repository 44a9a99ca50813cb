use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Connection parameters for the primary or a replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Database host
    pub host: String,

    /// Database port (default: 5432)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database user
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Database name
    pub dbname: String,

    /// SSL mode: disable, allow, prefer, require, verify-ca, verify-full
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
}

fn default_port() -> u16 {
    5432
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

impl ConnectionSettings {
    /// Human-readable target for logs and errors, without credentials
    pub fn target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.dbname)
    }
}

/// Optional pool sizing overrides; unset fields fall back to the
/// defaults of the workload class or replica they apply to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSizingSettings {
    /// Maximum open connections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_open: Option<u32>,

    /// Connections kept warm when idle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_idle: Option<u32>,

    /// Maximum connection lifetime in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lifetime_secs: Option<u64>,

    /// Maximum connection idle time in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_idle_time_secs: Option<u64>,
}

/// Per-workload-class pool sizing overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadPoolSettings {
    #[serde(default)]
    pub interactive: Option<PoolSizingSettings>,

    #[serde(default)]
    pub streaming: Option<PoolSizingSettings>,

    #[serde(default)]
    pub background: Option<PoolSizingSettings>,
}

/// Configuration for one read replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSettings {
    /// Connection parameters for the replica
    #[serde(flatten)]
    pub connection: ConnectionSettings,

    /// Load balancing weight (0 is treated as 1 during selection)
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Selection priority, lower number = preferred
    #[serde(default)]
    pub priority: i32,

    /// Pool sizing overrides for this replica
    #[serde(default)]
    pub pool: PoolSizingSettings,
}

fn default_weight() -> u32 {
    1
}

/// Circuit breaker defaults applied to breakers created by name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Failures before the circuit opens
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Seconds to wait before allowing half-open probes
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,

    /// Consecutive successful probes required to close the circuit
    #[serde(default = "default_required_successes")]
    pub required_successes: u32,

    /// Maximum probes admitted while half-open
    #[serde(default = "default_max_half_open")]
    pub max_half_open_probes: u32,
}

fn default_max_failures() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    30
}

fn default_required_successes() -> u32 {
    3
}

fn default_max_half_open() -> u32 {
    5
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            recovery_timeout_secs: default_recovery_timeout(),
            required_successes: default_required_successes(),
            max_half_open_probes: default_max_half_open(),
        }
    }
}

/// Replica manager and query observation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaManagerSettings {
    /// Interval between health check passes in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Timeout for a single health probe in seconds
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,

    /// How long a replica may stay unhealthy before operators should act
    #[serde(default = "default_max_unhealthy")]
    pub max_unhealthy_secs: u64,

    /// Consecutive probe failures tolerated before failover tooling reacts
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,

    /// Whether slow queries are logged
    #[serde(default = "default_slow_query_log")]
    pub enable_slow_query_log: bool,

    /// Queries slower than this are counted and logged as slow
    #[serde(default = "default_slow_query_threshold")]
    pub slow_query_threshold_ms: u64,
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_health_check_timeout() -> u64 {
    5
}

fn default_max_unhealthy() -> u64 {
    120
}

fn default_failover_threshold() -> u32 {
    3
}

fn default_slow_query_log() -> bool {
    true
}

fn default_slow_query_threshold() -> u64 {
    1000
}

impl Default for ReplicaManagerSettings {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval(),
            health_check_timeout_secs: default_health_check_timeout(),
            max_unhealthy_secs: default_max_unhealthy(),
            failover_threshold: default_failover_threshold(),
            enable_slow_query_log: default_slow_query_log(),
            slow_query_threshold_ms: default_slow_query_threshold(),
        }
    }
}

impl ReplicaManagerSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Primary database connection
    pub primary: ConnectionSettings,

    /// Named read replicas
    #[serde(default)]
    pub replicas: HashMap<String, ReplicaSettings>,

    /// Per-workload-class pool sizing overrides
    #[serde(default)]
    pub pools: WorkloadPoolSettings,

    /// Circuit breaker defaults
    #[serde(default)]
    pub breaker: BreakerSettings,

    /// Replica manager settings
    #[serde(default)]
    pub replica_manager: ReplicaManagerSettings,
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Recognized variables:
/// - DATABASE_HOST / DATABASE_PORT / DATABASE_USER / DATABASE_PASSWORD
/// - DATABASE_NAME / DATABASE_SSL_MODE
/// - READ_REPLICAS (comma-separated host:port list, sharing primary credentials)
/// - HEALTH_CHECK_INTERVAL (seconds)
/// - SLOW_QUERY_THRESHOLD_MS
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let host = std::env::var("DATABASE_HOST")
        .context("DATABASE_HOST environment variable not set")?;

    let port = match std::env::var("DATABASE_PORT") {
        Ok(raw) => raw
            .parse()
            .context("DATABASE_PORT is not a valid port number")?,
        Err(_) => default_port(),
    };

    let user = std::env::var("DATABASE_USER")
        .context("DATABASE_USER environment variable not set")?;

    let password = std::env::var("DATABASE_PASSWORD").unwrap_or_default();

    let dbname = std::env::var("DATABASE_NAME")
        .context("DATABASE_NAME environment variable not set")?;

    let ssl_mode = std::env::var("DATABASE_SSL_MODE").unwrap_or_else(|_| default_ssl_mode());

    let primary = ConnectionSettings {
        host,
        port,
        user,
        password,
        dbname,
        ssl_mode,
    };

    let mut replicas = HashMap::new();
    if let Ok(raw) = std::env::var("READ_REPLICAS") {
        for (idx, entry) in raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .enumerate()
        {
            let (host, port) = match entry.rsplit_once(':') {
                Some((h, p)) => (
                    h.to_string(),
                    p.parse()
                        .context(format!("invalid port in READ_REPLICAS entry '{}'", entry))?,
                ),
                None => (entry.to_string(), default_port()),
            };

            let connection = ConnectionSettings {
                host,
                port,
                ..primary.clone()
            };

            replicas.insert(
                format!("replica-{}", idx + 1),
                ReplicaSettings {
                    connection,
                    weight: default_weight(),
                    priority: 0,
                    pool: PoolSizingSettings::default(),
                },
            );
        }
    }

    let mut replica_manager = ReplicaManagerSettings::default();
    if let Ok(interval) = std::env::var("HEALTH_CHECK_INTERVAL") {
        if let Ok(val) = interval.parse() {
            replica_manager.health_check_interval_secs = val;
        }
    }
    if let Ok(threshold) = std::env::var("SLOW_QUERY_THRESHOLD_MS") {
        if let Ok(val) = threshold.parse() {
            replica_manager.slow_query_threshold_ms = val;
        }
    }

    Ok(Config {
        primary,
        replicas,
        pools: WorkloadPoolSettings::default(),
        breaker: BreakerSettings::default(),
        replica_manager,
    })
}

/// Load configuration from file or environment
///
/// Tries the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        load_from_yaml(path)
    } else {
        load_from_env()
    }
}
