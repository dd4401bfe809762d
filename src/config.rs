//! Configuration handling for the tenant connection manager.
//!
//! The binary reads [`Config`] from CLI arguments and environment variables and
//! turns it into a [`ManagerConfig`]; library users construct `ManagerConfig`
//! directly.

use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 0;
pub const DEFAULT_QUEUE_LIMIT: u32 = 50;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

// Background sweep defaults
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_POOL_IDLE_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_DEGRADED_THRESHOLD: u32 = 2;
pub const DEFAULT_CRITICAL_THRESHOLD: u32 = 5;

// Load governor defaults
pub const DEFAULT_HIGH_LOAD_RATIO: f64 = 0.8;
pub const DEFAULT_THROTTLE_FACTOR: f64 = 0.7;
pub const DEFAULT_MIN_THROTTLED_CONNECTIONS: u32 = 5;

// Retry defaults
pub const DEFAULT_TRANSACTION_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_BOOTSTRAP_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BOOTSTRAP_RETRY_DELAY_MS: u64 = 2000;
pub const DEFAULT_BOOTSTRAP_DEADLINE_SECS: u64 = 120;

pub const DEFAULT_TENANT_PREFIX: &str = "tenant_";
pub const DEFAULT_CONTROL_PLANE_KEY: &str = "control_plane";

/// Connection pool options, usually parsed from database URL query parameters.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10 for MySQL/PostgreSQL, 1 for SQLite)
    pub max_connections: Option<u32>,
    /// Minimum connections kept open (default: 0)
    pub min_connections: Option<u32>,
    /// Maximum number of callers allowed to wait for a connection (default: 50)
    pub queue_limit: Option<u32>,
    /// Idle timeout for individual connections in seconds (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
    /// Whether to test connections before use (default: true)
    pub test_before_acquire: Option<bool>,
}

impl PoolOptions {
    /// Pool option keys extracted from URL query parameters.
    const URL_KEYS: &'static [&'static str] = &[
        "max_connections",
        "min_connections",
        "queue_limit",
        "idle_timeout",
        "acquire_timeout",
        "test_before_acquire",
    ];

    /// Get max_connections with default value based on database type.
    pub fn max_connections_or_default(&self, is_sqlite: bool) -> u32 {
        self.max_connections.unwrap_or(if is_sqlite {
            DEFAULT_MAX_CONNECTIONS_SQLITE
        } else {
            DEFAULT_MAX_CONNECTIONS
        })
    }

    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    pub fn queue_limit_or_default(&self) -> u32 {
        self.queue_limit.unwrap_or(DEFAULT_QUEUE_LIMIT)
    }

    pub fn idle_timeout_or_default(&self) -> u64 {
        self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)
    }

    pub fn acquire_timeout_or_default(&self) -> u64 {
        self.acquire_timeout_secs
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS)
    }

    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    /// Options set here win; unset ones fall back to `defaults`.
    pub fn or(&self, defaults: &PoolOptions) -> Self {
        Self {
            max_connections: self.max_connections.or(defaults.max_connections),
            min_connections: self.min_connections.or(defaults.min_connections),
            queue_limit: self.queue_limit.or(defaults.queue_limit),
            idle_timeout_secs: self.idle_timeout_secs.or(defaults.idle_timeout_secs),
            acquire_timeout_secs: self.acquire_timeout_secs.or(defaults.acquire_timeout_secs),
            test_before_acquire: self.test_before_acquire.or(defaults.test_before_acquire),
        }
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
            if let Some(min) = self.min_connections {
                if min > max {
                    return Err(format!(
                        "min_connections ({}) cannot exceed max_connections ({})",
                        min, max
                    ));
                }
            }
        }
        Ok(())
    }

    /// Split pool options out of a connection URL.
    ///
    /// Returns the URL with the recognised keys removed (other query parameters
    /// are kept for the driver) and the parsed options. Unparseable values are
    /// ignored.
    pub fn from_url(connection_string: &str) -> Result<(String, Self), String> {
        let mut url = Url::parse(connection_string).map_err(|e| format!("Invalid URL: {e}"))?;
        let mut opts = extract_options(&mut url, Self::URL_KEYS);

        let options = Self {
            max_connections: opts.remove("max_connections").and_then(|v| v.parse().ok()),
            min_connections: opts.remove("min_connections").and_then(|v| v.parse().ok()),
            queue_limit: opts.remove("queue_limit").and_then(|v| v.parse().ok()),
            idle_timeout_secs: opts.remove("idle_timeout").and_then(|v| v.parse().ok()),
            acquire_timeout_secs: opts.remove("acquire_timeout").and_then(|v| v.parse().ok()),
            test_before_acquire: opts.remove("test_before_acquire").and_then(|v| {
                if v.eq_ignore_ascii_case("true") {
                    Some(true)
                } else if v.eq_ignore_ascii_case("false") {
                    Some(false)
                } else {
                    None
                }
            }),
        };
        options.validate()?;

        Ok((url.to_string(), options))
    }
}

/// Extract recognised options from URL query params, keeping others for the driver.
fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
    let mut opts = HashMap::new();
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(k, v)| {
            let key_lower = k.to_ascii_lowercase();
            if keys.contains(&key_lower.as_str()) {
                opts.insert(key_lower, v.into_owned());
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();

    if remaining.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(remaining);
    }
    opts
}

/// Database name from the last URL path segment, without SQLite file extensions.
pub fn database_name(connection_string: &str) -> Option<String> {
    let url = Url::parse(connection_string).ok()?;
    url.path()
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_end_matches(".sqlite").trim_end_matches(".db"))
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Retry policy for a transactional unit of work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based): `base_delay * multiplier^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(16) as i32);
        self.base_delay.mul_f64(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_TRANSACTION_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            multiplier: 2.0,
        }
    }
}

/// Runtime configuration for a [`ConnectionManager`](crate::db::ConnectionManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Full URL of the control-plane database (sensitive - not logged).
    pub control_plane_url: String,
    /// Registry key under which the control-plane pool is tracked.
    pub control_plane_key: String,
    /// Server-level URL used to derive per-key database URLs in `get_pool`.
    /// For SQLite this is a directory: `sqlite:///var/lib/app/dbs`.
    pub tenant_base_url: Option<String>,
    /// Keys with this prefix belong to the tenant provisioning lifecycle.
    pub tenant_prefix: String,
    /// Defaults applied to pools created by the manager.
    pub pool_options: PoolOptions,
    pub health_check_interval: Duration,
    pub cleanup_interval: Duration,
    /// Pools unused for longer than this are reclaimed.
    pub idle_timeout: Duration,
    /// Consecutive probe failures above which a pool is degraded.
    pub degraded_threshold: u32,
    /// Consecutive probe failures above which a pool is critical and recreated.
    pub critical_threshold: u32,
    pub high_load_ratio: f64,
    pub throttle_factor: f64,
    pub min_throttled_connections: u32,
    pub retry: RetryPolicy,
    pub bootstrap_max_attempts: u32,
    pub bootstrap_retry_delay: Duration,
    /// Upper bound on total time spent in one `ensure_connection` call.
    pub bootstrap_deadline: Option<Duration>,
}

impl ManagerConfig {
    /// Configuration with reference defaults for the given control-plane URL.
    ///
    /// The control-plane key is the database name from the URL.
    pub fn new(control_plane_url: impl Into<String>) -> Self {
        let control_plane_url = control_plane_url.into();
        let control_plane_key = database_name(&control_plane_url)
            .unwrap_or_else(|| DEFAULT_CONTROL_PLANE_KEY.to_string());
        Self {
            control_plane_url,
            control_plane_key,
            tenant_base_url: None,
            tenant_prefix: DEFAULT_TENANT_PREFIX.to_string(),
            pool_options: PoolOptions::default(),
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_POOL_IDLE_TIMEOUT_SECS),
            degraded_threshold: DEFAULT_DEGRADED_THRESHOLD,
            critical_threshold: DEFAULT_CRITICAL_THRESHOLD,
            high_load_ratio: DEFAULT_HIGH_LOAD_RATIO,
            throttle_factor: DEFAULT_THROTTLE_FACTOR,
            min_throttled_connections: DEFAULT_MIN_THROTTLED_CONNECTIONS,
            retry: RetryPolicy::default(),
            bootstrap_max_attempts: DEFAULT_BOOTSTRAP_MAX_ATTEMPTS,
            bootstrap_retry_delay: Duration::from_millis(DEFAULT_BOOTSTRAP_RETRY_DELAY_MS),
            bootstrap_deadline: Some(Duration::from_secs(DEFAULT_BOOTSTRAP_DEADLINE_SECS)),
        }
    }

    pub fn with_tenant_base_url(mut self, url: impl Into<String>) -> Self {
        self.tenant_base_url = Some(url.into());
        self
    }

    /// Whether `key` names a pool whose lifecycle is managed outside the registry.
    pub fn is_protected(&self, key: &str) -> bool {
        key == self.control_plane_key || self.is_tenant_key(key)
    }

    pub fn is_tenant_key(&self, key: &str) -> bool {
        key.starts_with(&self.tenant_prefix)
    }

    /// Pool key for a tenant code, e.g. `tenant_acme`.
    pub fn tenant_key(&self, tenant_code: &str) -> String {
        format!("{}{}", self.tenant_prefix, tenant_code)
    }
}

/// Operator subcommands.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create the control-plane database and tables if missing
    Bootstrap,
    /// Test connectivity to a database URL without registering a pool
    Check {
        /// Connection URL to probe
        url: String,
    },
    /// Start the health monitor and idle reclaimer and log pool stats until Ctrl-C
    Run {
        /// Seconds between stats reports
        #[arg(long, default_value_t = 60, env = "TENANT_DB_STATS_INTERVAL")]
        stats_interval: u64,
    },
}

/// Command-line configuration for the operator binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tenant-db-pool",
    about = "Multi-tenant database connection manager",
    version,
    author
)]
pub struct Config {
    /// Control-plane database URL. Pool options may be given as query parameters,
    /// e.g. ?max_connections=20&queue_limit=100
    #[arg(long, value_name = "URL", env = "TENANT_DB_CONTROL_PLANE_URL")]
    pub control_plane_url: String,

    /// Server-level URL used to derive per-database pools
    #[arg(long, value_name = "URL", env = "TENANT_DB_BASE_URL")]
    pub tenant_base_url: Option<String>,

    /// Key prefix reserved for tenant pools
    #[arg(long, default_value = DEFAULT_TENANT_PREFIX, env = "TENANT_DB_TENANT_PREFIX")]
    pub tenant_prefix: String,

    /// Health probe interval in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
        env = "TENANT_DB_HEALTH_INTERVAL"
    )]
    pub health_interval: u64,

    /// Idle reclaimer sweep interval in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_CLEANUP_INTERVAL_SECS,
        env = "TENANT_DB_CLEANUP_INTERVAL"
    )]
    pub cleanup_interval: u64,

    /// Seconds a pool may stay unused before it is reclaimed
    #[arg(
        long,
        default_value_t = DEFAULT_POOL_IDLE_TIMEOUT_SECS,
        env = "TENANT_DB_POOL_IDLE_TIMEOUT"
    )]
    pub pool_idle_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TENANT_DB_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "TENANT_DB_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// Build the manager configuration, splitting pool options out of the URL.
    pub fn manager_config(&self) -> Result<ManagerConfig, String> {
        let (control_plane_url, pool_options) = PoolOptions::from_url(&self.control_plane_url)?;

        let mut config = ManagerConfig::new(control_plane_url);
        config.tenant_base_url = self.tenant_base_url.clone();
        config.tenant_prefix = self.tenant_prefix.clone();
        config.pool_options = pool_options;
        config.health_check_interval = Duration::from_secs(self.health_interval.max(1));
        config.cleanup_interval = Duration::from_secs(self.cleanup_interval.max(1));
        config.idle_timeout = Duration::from_secs(self.pool_idle_timeout);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_options_defaults() {
        let opts = PoolOptions::default();
        assert_eq!(opts.max_connections_or_default(false), 10);
        assert_eq!(opts.max_connections_or_default(true), 1);
        assert_eq!(opts.min_connections_or_default(), 0);
        assert_eq!(opts.queue_limit_or_default(), 50);
        assert_eq!(opts.idle_timeout_or_default(), 600);
        assert_eq!(opts.acquire_timeout_or_default(), 30);
        assert!(opts.test_before_acquire_or_default());
    }

    #[test]
    fn test_parse_pool_options_from_url() {
        let (url, opts) = PoolOptions::from_url(
            "mysql://host/db?max_connections=20&queue_limit=80&charset=utf8",
        )
        .unwrap();

        assert_eq!(opts.max_connections, Some(20));
        assert_eq!(opts.queue_limit, Some(80));
        assert!(opts.idle_timeout_secs.is_none());
        assert_eq!(url, "mysql://host/db?charset=utf8");
    }

    #[test]
    fn test_pool_options_invalid_values_ignored() {
        let (_, opts) =
            PoolOptions::from_url("mysql://host/db?max_connections=lots&test_before_acquire=yes")
                .unwrap();
        assert!(opts.max_connections.is_none());
        assert!(opts.test_before_acquire.is_none());
    }

    #[test]
    fn test_pool_options_fallback() {
        let defaults = PoolOptions {
            max_connections: Some(4),
            queue_limit: Some(20),
            ..Default::default()
        };
        let merged = PoolOptions {
            max_connections: Some(8),
            ..Default::default()
        }
        .or(&defaults);
        assert_eq!(merged.max_connections, Some(8));
        assert_eq!(merged.queue_limit, Some(20));
        assert!(merged.min_connections.is_none());
    }

    #[test]
    fn test_pool_options_validation() {
        let err = PoolOptions::from_url("mysql://host/db?max_connections=0").unwrap_err();
        assert!(err.contains("max_connections"));

        let err = PoolOptions::from_url("mysql://host/db?min_connections=10&max_connections=5")
            .unwrap_err();
        assert!(err.contains("cannot exceed"));
    }

    #[test]
    fn test_database_name() {
        assert_eq!(
            database_name("mysql://u:p@host:3306/lumina_main"),
            Some("lumina_main".to_string())
        );
        assert_eq!(
            database_name("sqlite:///tmp/data/control.db"),
            Some("control".to_string())
        );
        assert_eq!(database_name("mysql://host:3306"), None);
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_manager_config_keys() {
        let config = ManagerConfig::new("mysql://u:p@host/platform");
        assert_eq!(config.control_plane_key, "platform");
        assert_eq!(config.tenant_key("acme"), "tenant_acme");
        assert!(config.is_protected("platform"));
        assert!(config.is_protected("tenant_acme"));
        assert!(!config.is_protected("reports"));
    }

    #[test]
    fn test_manager_config_reference_defaults() {
        let config = ManagerConfig::new("mysql://host:3306");
        assert_eq!(config.control_plane_key, DEFAULT_CONTROL_PLANE_KEY);
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.degraded_threshold, 2);
        assert_eq!(config.critical_threshold, 5);
    }

    #[test]
    fn test_cli_manager_config() {
        let config = Config::parse_from([
            "tenant-db-pool",
            "--control-plane-url",
            "mysql://u:p@host/platform?max_connections=25",
            "--pool-idle-timeout",
            "60",
            "bootstrap",
        ]);
        let manager = config.manager_config().unwrap();
        assert_eq!(manager.control_plane_url, "mysql://u:p@host/platform");
        assert_eq!(manager.pool_options.max_connections, Some(25));
        assert_eq!(manager.idle_timeout, Duration::from_secs(60));
        assert!(matches!(config.command, Command::Bootstrap));
    }
}
