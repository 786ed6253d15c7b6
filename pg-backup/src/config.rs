//! Configuration management for pg-backup.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Every field has a default, so a partial file only needs the values that differ.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backup::wal::DEFAULT_WAL_SEGMENT_MAX;
use crate::utils::{BackupError, Result};

/// Environment variable naming a config file when `--config` is not given
pub const CONFIG_ENV: &str = "PGBACKUP_CONFIG";

/// Environment variable overriding `notify.webhook`
pub const WEBHOOK_ENV: &str = "PGBACKUP_SLACK_WEBHOOK";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub wale: WaleConfig,
    pub storage: StorageConfig,
    pub service: ServiceConfig,
    pub restore: RestoreConfig,
    pub wal: WalConfig,
    pub cron: CronConfig,
    pub notify: NotifyConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaleConfig {
    /// WAL-E executable
    pub path: PathBuf,

    /// Root of every backup prefix, e.g. `gs://bucket/`
    pub gs_prefix: String,

    /// Google application credentials handed to WAL-E
    pub gs_app_creds: PathBuf,

    /// PostgreSQL data directory
    pub pgdata: PathBuf,

    /// Host whose backups this machine pushes
    pub host: String,

    /// OS user WAL-E runs as and that owns the data directory
    pub user: String,

    /// Working directory for WAL-E
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// gsutil executable
    pub gsutil: PathBuf,

    /// Maximum concurrent object copies
    pub copy_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub start: Vec<String>,
    pub stop: Vec<String>,

    /// Directory holding the PostgreSQL server logs followed during recovery
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Highest low-counter value before the high counter rolls over
    pub segment_max: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// Daily backups to keep
    pub daily: usize,

    /// Weekly backups to keep
    pub weekly: usize,

    /// Weekday (0 = Sunday) on which the weekly copy runs
    pub weekday: u32,

    /// Six-field cron expression used by `daemon`
    pub schedule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook: Option<String>,
    pub channel: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Mirror logs to the console
    pub console: bool,

    /// Log file directory
    pub dir: Option<PathBuf>,
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

impl Default for WaleConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/usr/local/bin/wal-e"),
            gs_prefix: "gs://postgresql-backups/".to_string(),
            gs_app_creds: PathBuf::from("/etc/pg-backup/gsAppCreds.json"),
            pgdata: PathBuf::from("/var/lib/postgresql/10/main"),
            host: local_hostname(),
            user: "postgres".to_string(),
            working_dir: Some(PathBuf::from("/var/lib/postgresql")),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            gsutil: PathBuf::from("/usr/local/bin/gsutil"),
            copy_concurrency: 16,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            start: vec!["service".into(), "postgresql".into(), "start".into()],
            stop: vec!["service".into(), "postgresql".into(), "stop".into()],
            log_dir: Some(PathBuf::from("/var/log/postgresql")),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            timeout_secs: 60 * 60,
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_max: DEFAULT_WAL_SEGMENT_MAX,
        }
    }
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            daily: 8,
            weekly: 12,
            weekday: 6,
            schedule: "0 0 2 * * *".to_string(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook: None,
            channel: "@dev-events".to_string(),
            username: "Postgres-Backup-Status".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: false,
            dir: None,
        }
    }
}

impl RestoreConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration: explicit path, then `$PGBACKUP_CONFIG`, then defaults.
    /// Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        if let Ok(webhook) = std::env::var(WEBHOOK_ENV) {
            if !webhook.is_empty() {
                config.notify.webhook = Some(webhook);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.wale.gs_prefix.trim().is_empty() {
            return Err(BackupError::Config("wale.gs_prefix cannot be empty".into()));
        }
        if self.wale.host.trim().is_empty() {
            return Err(BackupError::Config("wale.host cannot be empty".into()));
        }
        if self.restore.poll_interval_secs == 0 {
            return Err(BackupError::Config(
                "restore.poll_interval_secs must be positive".into(),
            ));
        }
        if self.storage.copy_concurrency == 0 {
            return Err(BackupError::Config(
                "storage.copy_concurrency must be positive".into(),
            ));
        }
        if self.cron.weekday > 6 {
            return Err(BackupError::Config(format!(
                "cron.weekday must be within 0..=6, got {}",
                self.cron.weekday
            )));
        }
        if self.service.start.is_empty() || self.service.stop.is_empty() {
            return Err(BackupError::Config(
                "service.start and service.stop need a command".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cron.daily, 8);
        assert_eq!(config.cron.weekly, 12);
        assert_eq!(config.cron.weekday, 6);
        assert_eq!(config.restore.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.restore.timeout(), Duration::from_secs(3600));
        assert_eq!(config.wal.segment_max, 0xFF);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [wale]
            gs_prefix = "gs://test-bucket/"
            host = "db-1"

            [cron]
            weekday = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.wale.gs_prefix, "gs://test-bucket/");
        assert_eq!(config.wale.host, "db-1");
        assert_eq!(config.wale.user, "postgres");
        assert_eq!(config.cron.weekday, 3);
        assert_eq!(config.cron.daily, 8);
        assert_eq!(config.storage.copy_concurrency, 16);
    }

    #[test]
    fn test_invalid_weekday_rejected() {
        let result = Config::from_toml("[cron]\nweekday = 7\n");
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let result = Config::from_toml("[restore]\npoll_interval_secs = 0\n");
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg-backup.toml");
        std::fs::write(&path, "[storage]\ncopy_concurrency = 4\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.storage.copy_concurrency, 4);

        let missing = Config::from_file(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(BackupError::Config(_))));
    }
}
