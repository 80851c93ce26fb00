//! Queue configuration, read once at process start.
//!
//! Parsing is a pure function of a lookup closure so tests never touch the
//! real process environment.

use core::str::FromStr;
use std::time::Duration;

use lingoq_core::WorkerId;

use crate::jobs::RetryPolicy;

/// Which queue engine the process talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// PostgreSQL table with `FOR UPDATE SKIP LOCKED` claims.
    Relational,
    /// Redis streams + consumer groups.
    Broker,
    /// In-process, no persistence. Tests and local dev only.
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Broker => "broker",
            Self::Memory => "memory",
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" | "postgres" => Ok(Self::Relational),
            "broker" | "redis" => Ok(Self::Broker),
            "memory" | "memory-for-tests" => Ok(Self::Memory),
            other => Err(ConfigError::invalid("QUEUE_BACKEND", other)),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is required for the {backend} backend")]
    Missing { var: &'static str, backend: &'static str },

    #[error("invalid value '{value}' for {var}")]
    Invalid { var: &'static str, value: String },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

impl ConfigError {
    fn invalid(var: &'static str, value: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            value: value.into(),
        }
    }
}

/// Per-job-type switches and concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTypeConfig {
    pub enabled: bool,
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub backend: BackendKind,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub key_prefix: String,

    pub default_max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub lease_duration: Duration,
    pub reclaim_interval: Duration,
    pub poll_interval: Duration,
    pub connect_attempts: u32,

    pub document: JobTypeConfig,
    pub text: JobTypeConfig,
    pub improvement: JobTypeConfig,

    pub shutdown_timeout: Duration,
    pub worker_id: WorkerId,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            database_url: None,
            database_max_connections: 20,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "lingoq".to_string(),
            default_max_attempts: 3,
            backoff_base: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(300_000),
            lease_duration: Duration::from_secs(600),
            reclaim_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(1_000),
            connect_attempts: 5,
            document: JobTypeConfig {
                enabled: true,
                concurrency: 3,
            },
            text: JobTypeConfig {
                enabled: true,
                concurrency: 5,
            },
            improvement: JobTypeConfig {
                enabled: true,
                concurrency: 2,
            },
            shutdown_timeout: Duration::from_secs(30),
            worker_id: WorkerId::generate(),
        }
    }
}

impl QueueConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; unset keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let d = Self::default();

        let backend = match get("QUEUE_BACKEND") {
            Some(v) => v.parse()?,
            None => d.backend,
        };

        let database_url = get("DATABASE_URL");
        if backend == BackendKind::Relational && database_url.is_none() {
            return Err(ConfigError::Missing {
                var: "DATABASE_URL",
                backend: backend.as_str(),
            });
        }

        let cfg = Self {
            backend,
            database_url,
            database_max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", d.database_max_connections)?,
            redis_url: get("REDIS_URL").unwrap_or(d.redis_url),
            key_prefix: get("QUEUE_KEY_PREFIX").unwrap_or(d.key_prefix),
            default_max_attempts: parse_or(&get, "QUEUE_DEFAULT_MAX_ATTEMPTS", d.default_max_attempts)?,
            backoff_base: Duration::from_millis(parse_or(&get, "QUEUE_BACKOFF_BASE_MS", 1_000u64)?),
            backoff_max: Duration::from_millis(parse_or(&get, "QUEUE_BACKOFF_MAX_MS", 300_000u64)?),
            lease_duration: Duration::from_secs(parse_or(&get, "QUEUE_LEASE_SECS", 600u64)?),
            reclaim_interval: Duration::from_secs(parse_or(&get, "QUEUE_RECLAIM_INTERVAL_SECS", 30u64)?),
            poll_interval: Duration::from_millis(parse_or(&get, "QUEUE_POLL_INTERVAL_MS", 1_000u64)?),
            connect_attempts: parse_or(&get, "QUEUE_CONNECT_ATTEMPTS", d.connect_attempts)?,
            document: JobTypeConfig {
                enabled: parse_bool_or(&get, "JOBS_DOCUMENT_ENABLED", true)?,
                concurrency: parse_or(&get, "WORKER_DOCUMENT_CONCURRENCY", d.document.concurrency)?,
            },
            text: JobTypeConfig {
                enabled: parse_bool_or(&get, "JOBS_TEXT_ENABLED", true)?,
                concurrency: parse_or(&get, "WORKER_TEXT_CONCURRENCY", d.text.concurrency)?,
            },
            improvement: JobTypeConfig {
                enabled: parse_bool_or(&get, "JOBS_IMPROVEMENT_ENABLED", true)?,
                concurrency: parse_or(&get, "WORKER_IMPROVEMENT_CONCURRENCY", d.improvement.concurrency)?,
            },
            shutdown_timeout: Duration::from_secs(parse_or(&get, "WORKER_SHUTDOWN_TIMEOUT_SECS", 30u64)?),
            worker_id: get("WORKER_ID").map(WorkerId::new).unwrap_or(d.worker_id),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_attempts == 0 {
            return Err(ConfigError::invalid("QUEUE_DEFAULT_MAX_ATTEMPTS", "0"));
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::invalid("QUEUE_CONNECT_ATTEMPTS", "0"));
        }
        for (var, jt) in [
            ("WORKER_DOCUMENT_CONCURRENCY", self.document),
            ("WORKER_TEXT_CONCURRENCY", self.text),
            ("WORKER_IMPROVEMENT_CONCURRENCY", self.improvement),
        ] {
            if jt.concurrency == 0 {
                return Err(ConfigError::invalid(var, "0"));
            }
        }
        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::Inconsistent(
                "QUEUE_BACKOFF_BASE_MS exceeds QUEUE_BACKOFF_MAX_MS".to_string(),
            ));
        }
        if self.reclaim_interval.is_zero() || self.reclaim_interval >= self.lease_duration {
            return Err(ConfigError::Inconsistent(
                "QUEUE_RECLAIM_INTERVAL_SECS must be positive and shorter than QUEUE_LEASE_SECS".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry policy for handler failures.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.default_max_attempts, self.backoff_base, self.backoff_max)
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::invalid(var, raw)),
        None => Ok(default),
    }
}

fn parse_bool_or<G>(get: &G, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::invalid(var, raw)),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<QueueConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        QueueConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.backend, BackendKind::Memory);
        assert_eq!(cfg.default_max_attempts, 3);
        assert_eq!(cfg.backoff_base, Duration::from_secs(1));
        assert_eq!(cfg.backoff_max, Duration::from_secs(300));
        assert_eq!(
            (cfg.document.concurrency, cfg.text.concurrency, cfg.improvement.concurrency),
            (3, 5, 2)
        );
        assert!(cfg.document.enabled && cfg.text.enabled && cfg.improvement.enabled);
        assert!(cfg.worker_id.as_str().starts_with("worker-"));
    }

    #[test]
    fn backend_aliases() {
        assert_eq!("postgres".parse::<BackendKind>().unwrap(), BackendKind::Relational);
        assert_eq!("REDIS".parse::<BackendKind>().unwrap(), BackendKind::Broker);
        assert_eq!("memory-for-tests".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert!("kafka".parse::<BackendKind>().is_err());
    }

    #[test]
    fn relational_requires_database_url() {
        assert_eq!(
            load(&[("QUEUE_BACKEND", "relational")]).unwrap_err(),
            ConfigError::Missing {
                var: "DATABASE_URL",
                backend: "relational"
            }
        );
        let cfg = load(&[
            ("QUEUE_BACKEND", "relational"),
            ("DATABASE_URL", "postgres://localhost/lingoq"),
        ])
        .unwrap();
        assert_eq!(cfg.backend, BackendKind::Relational);
    }

    #[test]
    fn overrides_and_flags() {
        let cfg = load(&[
            ("QUEUE_DEFAULT_MAX_ATTEMPTS", "5"),
            ("JOBS_TEXT_ENABLED", "false"),
            ("WORKER_DOCUMENT_CONCURRENCY", "1"),
            ("WORKER_ID", "node-a"),
        ])
        .unwrap();
        assert_eq!(cfg.default_max_attempts, 5);
        assert!(!cfg.text.enabled);
        assert_eq!(cfg.document.concurrency, 1);
        assert_eq!(cfg.worker_id.as_str(), "node-a");
        assert_eq!(cfg.retry_policy().max_attempts, 5);
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(matches!(
            load(&[("QUEUE_LEASE_SECS", "ten")]),
            Err(ConfigError::Invalid { var: "QUEUE_LEASE_SECS", .. })
        ));
        assert!(load(&[("JOBS_DOCUMENT_ENABLED", "maybe")]).is_err());
        assert!(load(&[("WORKER_TEXT_CONCURRENCY", "0")]).is_err());
        assert!(load(&[("QUEUE_DEFAULT_MAX_ATTEMPTS", "0")]).is_err());
    }

    #[test]
    fn reclaim_interval_must_be_shorter_than_lease() {
        assert!(matches!(
            load(&[("QUEUE_LEASE_SECS", "30"), ("QUEUE_RECLAIM_INTERVAL_SECS", "30")]),
            Err(ConfigError::Inconsistent(_))
        ));
        assert!(load(&[("QUEUE_BACKOFF_BASE_MS", "10"), ("QUEUE_BACKOFF_MAX_MS", "5")]).is_err());
    }
}
