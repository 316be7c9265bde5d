//! Configuration for the ingestion core
//!
//! Every component has its own config struct with sensible defaults, a
//! `from_env()` constructor and `with_*` builders. [`IngestConfig`] bundles
//! them for the daemon.

use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::queue::QueueConfig;
use crate::ratelimit::RateLimiterConfig;
use crate::scheduler::SchedulerConfig;
use crate::worker::{PoolConfig, WorkerConfig};

/// Default bind address for the admin HTTP surface
pub const DEFAULT_ADMIN_ADDR: &str = "0.0.0.0:9090";

/// Errors raised while assembling configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Read and parse an environment variable, ignoring unset or unparsable values
pub(crate) fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Serde adapter storing a `Duration` as integer milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Complete configuration of an ingestion process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// PostgreSQL connection string; `None` selects the in-memory backends
    #[serde(skip_serializing)]
    pub database_url: Option<String>,

    /// Admin HTTP bind address
    pub admin_addr: SocketAddr,

    pub queue: QueueConfig,
    pub rate_limiter: RateLimiterConfig,
    pub worker: WorkerConfig,
    pub pool: PoolConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            admin_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            queue: QueueConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            worker: WorkerConfig::default(),
            pool: PoolConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Create configuration from environment variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection string (optional)
    /// - `ADMIN_ADDR`: admin bind address (default: 0.0.0.0:9090)
    ///
    /// Component settings are read by each component's own `from_env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let admin_addr = match std::env::var("ADMIN_ADDR") {
            Ok(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    name: "ADMIN_ADDR".to_string(),
                    value,
                })?,
            Err(_) => DEFAULT_ADMIN_ADDR
                .parse()
                .map_err(|_| ConfigError::Invalid("bad default admin address".into()))?,
        };

        let config = Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            admin_addr,
            queue: QueueConfig::from_env(),
            rate_limiter: RateLimiterConfig::from_env(),
            worker: WorkerConfig::from_env(),
            pool: PoolConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_admin_addr(mut self, addr: SocketAddr) -> Self {
        self.admin_addr = addr;
        self
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.pool.min_workers > self.pool.max_workers {
            return Err(ConfigError::Invalid(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.pool.min_workers, self.pool.max_workers
            )));
        }
        if self.queue.stale_worker_threshold > self.queue.dead_worker_threshold {
            return Err(ConfigError::Invalid(
                "stale worker threshold exceeds dead worker threshold".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.database_url.is_none());
        assert_eq!(config.admin_addr.port(), 9090);
    }

    #[test]
    fn test_validate_worker_bounds() {
        let mut config = IngestConfig::default();
        config.pool.min_workers = config.pool.max_workers + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duration_millis_serialization() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(with = "duration_millis")]
            value: Duration,
        }

        let json = serde_json::to_string(&Wrapper {
            value: Duration::from_secs(2),
        })
        .unwrap();
        assert_eq!(json, r#"{"value":2000}"#);

        let parsed: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.value, Duration::from_secs(2));
    }

    #[test]
    fn test_env_parse_ignores_garbage() {
        assert_eq!(env_parse::<u32>("HARVESTER_TEST_UNSET_VARIABLE"), None);
    }
}
