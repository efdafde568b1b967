//! Worker configuration, read from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::jobs::RunnerConfig;
use crate::provisioning::CliSettings;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub worker_name: String,
    pub max_jobs: usize,
    pub job_timeout: Duration,
    pub max_tries: u32,
    pub result_ttl: Duration,
    pub poll_interval: Duration,
    pub retention: chrono::Duration,
    pub stale_after: chrono::Duration,
    pub maintenance_interval: Duration,
    pub workspace_root: PathBuf,
    pub iac_binary: String,
    pub iac_modules_dir: Option<PathBuf>,
    pub iac_plugin_cache_dir: PathBuf,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable source. Empty values count as unset.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let database_url = var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let redis_url = var("REDIS_URL");
        if redis_url.is_none() {
            warn!("REDIS_URL not set; using the in-process task queue (single worker only)");
        }

        let worker_name = var("WORKER_NAME").unwrap_or_else(|| "openlabs-worker".to_string());
        let max_jobs: usize = parse_or(&var, "WORKER_MAX_JOBS", 4)?;
        if max_jobs == 0 {
            return Err(invalid("WORKER_MAX_JOBS", "0", "must be at least 1"));
        }
        let timeout_secs: u64 = parse_or(&var, "JOB_TIMEOUT_SECS", 1200)?;
        let max_tries: u32 = parse_or(&var, "JOB_MAX_TRIES", 3)?;
        if max_tries == 0 {
            return Err(invalid("JOB_MAX_TRIES", "0", "must be at least 1"));
        }
        let result_ttl_secs: u64 = parse_or(&var, "QUEUE_RESULT_TTL_SECS", 86_400)?;
        let poll_ms: u64 = parse_or(&var, "QUEUE_POLL_INTERVAL_MS", 500)?;
        let retention_days: i64 = parse_or(&var, "JOB_RETENTION_DAYS", 30)?;
        let stale_after_secs: i64 =
            parse_or(&var, "JOB_STALE_AFTER_SECS", (timeout_secs as i64).saturating_mul(2))?;
        let maintenance_secs: u64 = parse_or(&var, "MAINTENANCE_INTERVAL_SECS", 3600)?;
        if maintenance_secs == 0 {
            return Err(invalid("MAINTENANCE_INTERVAL_SECS", "0", "must be at least 1"));
        }

        let workspace_root = var("WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("openlabs"));
        let iac_binary = var("IAC_BINARY").unwrap_or_else(|| "tofu".to_string());
        let iac_modules_dir = var("IAC_MODULES_DIR").map(PathBuf::from);
        if iac_modules_dir.is_none() {
            warn!("IAC_MODULES_DIR not set; deploy and destroy jobs will fail");
        }
        let iac_plugin_cache_dir = var("IAC_PLUGIN_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace_root.join(".plugin-cache"));

        Ok(Self {
            database_url,
            redis_url,
            worker_name,
            max_jobs,
            job_timeout: Duration::from_secs(timeout_secs),
            max_tries,
            result_ttl: Duration::from_secs(result_ttl_secs),
            poll_interval: Duration::from_millis(poll_ms),
            retention: chrono::Duration::days(retention_days),
            stale_after: chrono::Duration::seconds(stale_after_secs),
            maintenance_interval: Duration::from_secs(maintenance_secs),
            workspace_root,
            iac_binary,
            iac_modules_dir,
            iac_plugin_cache_dir,
        })
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            poll_interval: self.poll_interval,
            ..RunnerConfig::default()
        }
        .with_name(self.worker_name.clone())
        .with_max_jobs(self.max_jobs)
        .with_job_timeout(self.job_timeout)
        .with_max_tries(self.max_tries)
    }

    /// CLI settings, or `None` when no module directory is configured.
    pub fn cli_settings(&self) -> Option<CliSettings> {
        self.iac_modules_dir.as_ref().map(|modules_dir| CliSettings {
            binary: PathBuf::from(&self.iac_binary),
            modules_dir: modules_dir.clone(),
            plugin_cache_dir: Some(self.iac_plugin_cache_dir.clone()),
        })
    }
}

fn parse_or<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(config(&[]).unwrap_err(), ConfigError::Missing("DATABASE_URL"));
        assert_eq!(
            config(&[("DATABASE_URL", "  ")]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
    }

    #[test]
    fn defaults_apply() {
        let cfg = config(&[("DATABASE_URL", "postgres://localhost/openlabs")]).unwrap();
        assert_eq!(cfg.max_jobs, 4);
        assert_eq!(cfg.job_timeout, Duration::from_secs(1200));
        assert_eq!(cfg.max_tries, 3);
        assert_eq!(cfg.result_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.retention, chrono::Duration::days(30));
        assert_eq!(cfg.stale_after, chrono::Duration::seconds(2400));
        assert_eq!(cfg.iac_binary, "tofu");
        assert!(cfg.redis_url.is_none());
        assert!(cfg.cli_settings().is_none());
    }

    #[test]
    fn stale_threshold_follows_timeout() {
        let cfg = config(&[
            ("DATABASE_URL", "postgres://localhost/openlabs"),
            ("JOB_TIMEOUT_SECS", "60"),
        ])
        .unwrap();
        assert_eq!(cfg.stale_after, chrono::Duration::seconds(120));
        assert_eq!(cfg.runner_config().job_timeout, Duration::from_secs(60));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = config(&[
            ("DATABASE_URL", "postgres://localhost/openlabs"),
            ("WORKER_MAX_JOBS", "lots"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "WORKER_MAX_JOBS", .. }));

        let err = config(&[
            ("DATABASE_URL", "postgres://localhost/openlabs"),
            ("JOB_MAX_TRIES", "0"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "JOB_MAX_TRIES", .. }));
    }

    #[test]
    fn cli_settings_use_modules_dir() {
        let cfg = config(&[
            ("DATABASE_URL", "postgres://localhost/openlabs"),
            ("IAC_MODULES_DIR", "/opt/openlabs/modules"),
            ("WORKSPACE_ROOT", "/var/lib/openlabs"),
        ])
        .unwrap();
        let cli = cfg.cli_settings().unwrap();
        assert_eq!(cli.modules_dir, PathBuf::from("/opt/openlabs/modules"));
        assert_eq!(
            cli.plugin_cache_dir,
            Some(PathBuf::from("/var/lib/openlabs/.plugin-cache"))
        );
    }
}
