//! Process settings: the queue configuration plus worker-binary knobs.

use std::net::SocketAddr;
use std::time::Duration;

use lingoq_infra::{ConfigError, QueueConfig};
use lingoq_observability::LogFormat;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Queue(#[from] ConfigError),
    #[error("invalid value for {var}: '{value}'")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue: QueueConfig,
    /// `None` disables the admin server.
    pub admin_addr: Option<SocketAddr>,
    pub log_format: LogFormat,
    pub stats_interval: Duration,
    /// Terminal jobs older than this are purged.
    pub retention: Duration,
    pub purge_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            admin_addr: Some(SocketAddr::from(([0, 0, 0, 0], 8080))),
            log_format: LogFormat::default(),
            stats_interval: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            purge_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue = QueueConfig::from_lookup(&lookup)?;
        let d = Self::default();

        let admin_addr = match lookup("ADMIN_ADDR") {
            None => d.admin_addr,
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(raw.trim().parse().map_err(|_| SettingsError::Invalid {
                var: "ADMIN_ADDR",
                value: raw.clone(),
            })?),
        };

        let log_format = match lookup("LOG_FORMAT") {
            Some(raw) => raw.parse().map_err(|_| SettingsError::Invalid {
                var: "LOG_FORMAT",
                value: raw.clone(),
            })?,
            None => d.log_format,
        };

        let secs = |var: &'static str, default: Duration| -> Result<Duration, SettingsError> {
            match lookup(var) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|s| *s > 0)
                    .map(Duration::from_secs)
                    .ok_or(SettingsError::Invalid { var, value: raw }),
                None => Ok(default),
            }
        };

        Ok(Self {
            queue,
            admin_addr,
            log_format,
            stats_interval: secs("STATS_INTERVAL_SECS", d.stats_interval)?,
            retention: secs("JOB_RETENTION_SECS", d.retention)?,
            purge_interval: secs("PURGE_INTERVAL_SECS", d.purge_interval)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerSettings, SettingsError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        WorkerSettings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let s = load(&[]).unwrap();
        assert_eq!(s.admin_addr, Some("0.0.0.0:8080".parse().unwrap()));
        assert_eq!(s.log_format, LogFormat::Json);
        assert_eq!(s.retention, Duration::from_secs(604_800));
    }

    #[test]
    fn empty_admin_addr_disables_server() {
        let s = load(&[("ADMIN_ADDR", ""), ("LOG_FORMAT", "pretty")]).unwrap();
        assert_eq!(s.admin_addr, None);
        assert_eq!(s.log_format, LogFormat::Pretty);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(load(&[("ADMIN_ADDR", "nowhere")]), Err(SettingsError::Invalid { var: "ADMIN_ADDR", .. })));
        assert!(matches!(load(&[("STATS_INTERVAL_SECS", "0")]), Err(SettingsError::Invalid { .. })));
        assert!(matches!(load(&[("QUEUE_BACKEND", "kafka")]), Err(SettingsError::Queue(_))));
    }
}
