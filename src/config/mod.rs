mod file_config;

pub use file_config::{ClickHouseConfig, FileConfig, SyncConfig};

use crate::sync::{
    SyncSettings, DEFAULT_BATCH_COUNT, DEFAULT_BATCH_SIZE, DEFAULT_LEASE_TTL, DEFAULT_MAX_RUNTIME,
};
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CLICKHOUSE_TABLE: &str = "ci_finished_builds";
pub const DEFAULT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_AUDIT_LOG_RETENTION_DAYS: u64 = 30;
const DEFAULT_CLICKHOUSE_TIMEOUT_SECS: u64 = 30;

/// Where enriched rows are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DestinationKind {
    /// Local analytics database in `db_dir`.
    #[default]
    Sqlite,
    /// ClickHouse over its HTTP interface.
    Clickhouse,
    /// No destination; invocations report `db_not_configured`.
    None,
}

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub metrics_port: u16,
    pub destination: DestinationKind,
    pub shard_count: Option<u32>,
    pub batch_size: Option<usize>,
    pub batch_count: Option<usize>,
    pub max_runtime_secs: Option<u64>,
    pub interval_secs: Option<u64>,
    pub clickhouse_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub metrics_port: u16,
    pub sync: SyncSettings,
    pub shard_count: u32,
    pub interval: Duration,
    pub audit_log_retention_days: u64,
    pub destination: DestinationSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationSettings {
    Sqlite,
    ClickHouse(ClickHouseSettings),
    NotConfigured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickHouseSettings {
    pub url: String,
    pub table: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let sync_file = file.sync.unwrap_or_default();
        let sync = SyncSettings {
            batch_size: sync_file
                .batch_size
                .or(cli.batch_size)
                .unwrap_or(DEFAULT_BATCH_SIZE),
            batch_count: sync_file
                .batch_count
                .or(cli.batch_count)
                .unwrap_or(DEFAULT_BATCH_COUNT),
            max_runtime: sync_file
                .max_runtime_secs
                .or(cli.max_runtime_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_MAX_RUNTIME),
            lease_ttl: sync_file
                .lease_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_LEASE_TTL),
        };
        if let Err(e) = sync.validate() {
            bail!("Invalid sync settings: {}", e);
        }

        let shard_count = sync_file.shard_count.or(cli.shard_count).unwrap_or(1);
        if shard_count == 0 {
            bail!("shard_count must be at least 1");
        }
        let interval = Duration::from_secs(
            sync_file
                .interval_secs
                .or(cli.interval_secs)
                .unwrap_or(DEFAULT_INTERVAL_SECS),
        );
        let audit_log_retention_days = sync_file
            .audit_log_retention_days
            .unwrap_or(DEFAULT_AUDIT_LOG_RETENTION_DAYS);

        let destination_kind = match file.destination {
            Some(name) => match parse_destination(&name) {
                Some(kind) => kind,
                None => bail!("Unknown destination in config file: {}", name),
            },
            None => cli.destination,
        };
        let clickhouse_file = file.clickhouse.unwrap_or_default();
        let destination = match destination_kind {
            DestinationKind::Sqlite => DestinationSettings::Sqlite,
            DestinationKind::None => DestinationSettings::NotConfigured,
            DestinationKind::Clickhouse => {
                let url = clickhouse_file
                    .url
                    .or_else(|| cli.clickhouse_url.clone())
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "ClickHouse destination requires --clickhouse-url or [clickhouse].url"
                        )
                    })?;
                DestinationSettings::ClickHouse(ClickHouseSettings {
                    url,
                    table: clickhouse_file
                        .table
                        .unwrap_or_else(|| DEFAULT_CLICKHOUSE_TABLE.to_string()),
                    user: clickhouse_file.user,
                    password: clickhouse_file.password,
                    timeout: Duration::from_secs(
                        clickhouse_file
                            .timeout_secs
                            .unwrap_or(DEFAULT_CLICKHOUSE_TIMEOUT_SECS),
                    ),
                })
            }
        };

        Ok(Self {
            db_dir,
            metrics_port,
            sync,
            shard_count,
            interval,
            audit_log_retention_days,
            destination,
        })
    }

    pub fn source_db_path(&self) -> PathBuf {
        self.db_dir.join("source.db")
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.db_dir.join("state.db")
    }

    pub fn analytics_db_path(&self) -> PathBuf {
        self.db_dir.join("analytics.db")
    }
}

/// Uses clap's ValueEnum trait for parsing.
fn parse_destination(s: &str) -> Option<DestinationKind> {
    DestinationKind::from_str(s, true).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn test_parse_destination() {
        assert_eq!(parse_destination("sqlite"), Some(DestinationKind::Sqlite));
        assert_eq!(
            parse_destination("ClickHouse"),
            Some(DestinationKind::Clickhouse)
        );
        assert_eq!(parse_destination("none"), Some(DestinationKind::None));
        assert!(parse_destination("postgres").is_none());
    }

    #[test]
    fn test_resolve_defaults() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.sync.batch_size, 500);
        assert_eq!(config.sync.batch_count, 10);
        assert_eq!(config.sync.max_runtime, Duration::from_secs(240));
        assert_eq!(config.sync.lease_ttl, Duration::from_secs(600));
        assert_eq!(config.shard_count, 1);
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.destination, DestinationSettings::Sqlite);
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            metrics_port: 9091,
            shard_count: Some(2),
            batch_size: Some(100),
            ..Default::default()
        };

        let file_config = FileConfig {
            db_dir: Some(temp_dir.path().to_string_lossy().to_string()),
            sync: Some(SyncConfig {
                shard_count: Some(8),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.shard_count, 8);
        // CLI value used when TOML doesn't specify
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.metrics_port, 9091);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let cli = CliConfig::default();
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_rejects_ttl_not_above_runtime() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            max_runtime_secs: Some(900),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("lease_ttl"));
    }

    #[test]
    fn test_resolve_rejects_zero_runtime_and_oversized_pages() {
        let temp_dir = make_temp_db_dir();
        let zero_runtime = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            max_runtime_secs: Some(0),
            ..Default::default()
        };
        let err = AppConfig::resolve(&zero_runtime, None).unwrap_err();
        assert!(err.to_string().contains("max_runtime"));

        let oversized = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            batch_size: Some(50_000),
            ..Default::default()
        };
        let err = AppConfig::resolve(&oversized, None).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_resolve_clickhouse_requires_url() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            destination: DestinationKind::Clickhouse,
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli, None).is_err());

        let file_config = FileConfig {
            clickhouse: Some(ClickHouseConfig {
                url: Some("http://clickhouse:8123".to_string()),
                user: Some("sync".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();
        match config.destination {
            DestinationSettings::ClickHouse(settings) => {
                assert_eq!(settings.url, "http://clickhouse:8123");
                assert_eq!(settings.table, DEFAULT_CLICKHOUSE_TABLE);
                assert_eq!(settings.user.as_deref(), Some("sync"));
                assert_eq!(settings.timeout, Duration::from_secs(30));
            }
            other => panic!("unexpected destination {:?}", other),
        }
    }

    #[test]
    fn test_resolve_destination_none() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        let file_config = FileConfig {
            destination: Some("none".to_string()),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();
        assert_eq!(config.destination, DestinationSettings::NotConfigured);
    }

    #[test]
    fn test_db_path_helpers() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.source_db_path(), temp_dir.path().join("source.db"));
        assert_eq!(config.state_db_path(), temp_dir.path().join("state.db"));
        assert_eq!(
            config.analytics_db_path(),
            temp_dir.path().join("analytics.db")
        );
    }
}
