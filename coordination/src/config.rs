//! Hive coordination configuration
//!
//! Defaults are usable as-is. A TOML file can override any subset of
//! fields, and `HIVE_*` environment variables override the file.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `HIVE_INSTANCE_ID` | random | Identifier reported in state snapshots |
//! | `HIVE_STORE_NAMESPACE` | `hive` | Key prefix in the backing store |
//! | `HIVE_REDIS_URL` | unset | Redis URL (requires the `redis-store` feature) |
//! | `HIVE_LOCK_TIMEOUT_SECS` | `30` | Lock expiry |
//! | `HIVE_LOCK_RETRY_DELAY_MS` | `100` | Delay between acquisition attempts |
//! | `HIVE_LOCK_MAX_RETRIES` | `100` | Attempts before giving up |
//! | `HIVE_SESSION_TTL_SECS` | `3600` | Default (sliding) session TTL |
//! | `HIVE_BUS_RESPONSE_TIMEOUT_SECS` | `30` | Ceiling for request/response waits |
//! | `HIVE_BUS_HISTORY_CAPACITY` | `10000` | Envelopes retained for audit |
//! | `HIVE_BUS_AGENTS` | empty | Comma-separated agents registered at startup |
//! | `HIVE_BREAKER_MAX_FAILURES` | `5` | Failures before a breaker opens |
//! | `HIVE_BREAKER_TIMEOUT_SECS` | `60` | Cool-down before a breaker half-opens |
//! | `HIVE_EVENT_LOG_CAPACITY` | `1000` | Emergency events retained |

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::lock::AcquireOptions;

/// Errors loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Distributed lock defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock expiry in seconds
    pub timeout_secs: u64,
    /// Delay between acquisition attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Acquisition attempts before timing out
    pub max_retries: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            retry_delay_ms: 100,
            max_retries: 100,
        }
    }
}

impl LockConfig {
    /// Acquisition options built from these defaults
    pub fn acquire_options(&self) -> AcquireOptions {
        AcquireOptions {
            timeout: Duration::from_secs(self.timeout_secs),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_retries: self.max_retries,
        }
    }
}

/// Session store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// TTL applied on create (when none is given) and on every read
    pub default_ttl_secs: u64,
    /// Compare-and-swap attempts for read-modify-write paths
    pub write_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            write_retries: 5,
        }
    }
}

impl SessionConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Message bus settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Ceiling for request/response waits, in seconds
    pub response_timeout_secs: u64,
    /// How long `get_messages` waits for a first envelope, in milliseconds
    pub drain_window_ms: u64,
    /// Pending envelopes above which a mailbox counts as backlogged
    pub backlog_threshold: usize,
    /// Messages required before the delivery rate is judged
    pub min_messages_for_rate: usize,
    /// Delivery rate (0.0-1.0) below which the bus is critical
    pub min_delivery_rate: f64,
    /// Envelopes kept in the audit history
    pub history_capacity: usize,
    /// Agents registered on the bus at startup
    pub agents: Vec<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: 30,
            drain_window_ms: 100,
            backlog_threshold: 100,
            min_messages_for_rate: 100,
            min_delivery_rate: 0.8,
            history_capacity: 10_000,
            agents: Vec::new(),
        }
    }
}

impl BusConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }
}

/// Emergency controls and circuit breaker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    /// Failures before a breaker opens
    pub max_failures: u32,
    /// Seconds after the last failure before an open breaker half-opens
    pub circuit_breaker_timeout_secs: u64,
    /// Audit events retained in memory
    pub event_log_capacity: usize,
    /// Events included in a state snapshot
    pub recent_events: usize,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            circuit_breaker_timeout_secs: 60,
            event_log_capacity: 1000,
            recent_events: 10,
        }
    }
}

impl EmergencyConfig {
    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_timeout_secs)
    }
}

/// Backing store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Key prefix for every entry the hive writes
    pub namespace: String,
    /// Redis URL; unset means the in-process store
    pub redis_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: crate::store::schema::DEFAULT_NAMESPACE.to_string(),
            redis_url: None,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    /// Identifier for this instance; generated when unset
    pub instance_id: Option<String>,
    pub store: StoreConfig,
    pub lock: LockConfig,
    pub session: SessionConfig,
    pub bus: BusConfig,
    pub emergency: EmergencyConfig,
}

impl HiveConfig {
    /// Defaults overridden by environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Load a TOML file, then apply environment overrides
    pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without touching the environment
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply `HIVE_*` overrides. Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("HIVE_INSTANCE_ID") {
            self.instance_id = Some(id);
        }
        if let Ok(ns) = std::env::var("HIVE_STORE_NAMESPACE") {
            self.store.namespace = ns;
        }
        if let Ok(url) = std::env::var("HIVE_REDIS_URL") {
            self.store.redis_url = Some(url);
        }
        env_parse("HIVE_LOCK_TIMEOUT_SECS", &mut self.lock.timeout_secs);
        env_parse("HIVE_LOCK_RETRY_DELAY_MS", &mut self.lock.retry_delay_ms);
        env_parse("HIVE_LOCK_MAX_RETRIES", &mut self.lock.max_retries);
        env_parse("HIVE_SESSION_TTL_SECS", &mut self.session.default_ttl_secs);
        env_parse(
            "HIVE_BUS_RESPONSE_TIMEOUT_SECS",
            &mut self.bus.response_timeout_secs,
        );
        env_parse("HIVE_BUS_HISTORY_CAPACITY", &mut self.bus.history_capacity);
        if let Ok(agents) = std::env::var("HIVE_BUS_AGENTS") {
            self.bus.agents = agents
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
        }
        env_parse("HIVE_BREAKER_MAX_FAILURES", &mut self.emergency.max_failures);
        env_parse(
            "HIVE_BREAKER_TIMEOUT_SECS",
            &mut self.emergency.circuit_breaker_timeout_secs,
        );
        env_parse(
            "HIVE_EVENT_LOG_CAPACITY",
            &mut self.emergency.event_log_capacity,
        );
    }

    /// Reject values the components cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.lock.timeout_secs == 0 {
            return Err(ConfigError::Invalid("lock.timeout_secs must be > 0".into()));
        }
        if self.lock.max_retries == 0 {
            return Err(ConfigError::Invalid("lock.max_retries must be > 0".into()));
        }
        if self.session.default_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.default_ttl_secs must be > 0".into(),
            ));
        }
        if self.emergency.max_failures == 0 {
            return Err(ConfigError::Invalid(
                "emergency.max_failures must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.bus.min_delivery_rate) {
            return Err(ConfigError::Invalid(
                "bus.min_delivery_rate must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }

    /// The configured instance id, or a fresh one
    pub fn resolve_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("instance-{}", uuid::Uuid::new_v4()))
    }
}

fn env_parse<T: FromStr>(var: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(var) {
        match raw.trim().parse() {
            Ok(v) => *target = v,
            Err(_) => warn!(var, value = %raw, "Ignoring unparseable environment override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = HiveConfig::default();
        assert_eq!(config.lock.timeout_secs, 30);
        assert_eq!(config.lock.retry_delay_ms, 100);
        assert_eq!(config.lock.max_retries, 100);
        assert_eq!(config.session.default_ttl_secs, 3600);
        assert_eq!(config.bus.response_timeout_secs, 30);
        assert_eq!(config.emergency.max_failures, 5);
        assert_eq!(config.emergency.circuit_breaker_timeout_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = HiveConfig::from_toml_str(
            r#"
            instance_id = "queen-1"

            [lock]
            timeout_secs = 5

            [bus]
            agents = ["queen", "maths_bee"]

            [emergency]
            max_failures = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.instance_id.as_deref(), Some("queen-1"));
        assert_eq!(config.lock.timeout_secs, 5);
        assert_eq!(config.lock.max_retries, 100);
        assert_eq!(config.emergency.max_failures, 3);
        assert_eq!(config.bus.agents, vec!["queen", "maths_bee"]);
        assert_eq!(config.session.default_ttl_secs, 3600);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session]\ndefault_ttl_secs = 120").unwrap();
        let config = HiveConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.session.default_ttl(), Duration::from_secs(120));
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[lock\ntimeout_secs = ").unwrap();
        let err = HiveConfig::from_toml_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = HiveConfig::from_toml_file("/nonexistent/hive.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = HiveConfig::default();
        config.emergency.max_failures = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lock_acquire_options() {
        let opts = LockConfig::default().acquire_options();
        assert_eq!(opts.timeout, Duration::from_secs(30));
        assert_eq!(opts.retry_delay, Duration::from_millis(100));
        assert_eq!(opts.max_retries, 100);
    }

    #[test]
    fn test_resolve_instance_id() {
        let mut config = HiveConfig::default();
        assert!(config.resolve_instance_id().starts_with("instance-"));
        config.instance_id = Some("queen-a".into());
        assert_eq!(config.resolve_instance_id(), "queen-a");
    }
}
