use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub metrics_port: Option<u16>,
    /// "sqlite", "clickhouse" or "none"
    pub destination: Option<String>,

    pub sync: Option<SyncConfig>,
    pub clickhouse: Option<ClickHouseConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: Option<usize>,
    pub batch_count: Option<usize>,
    pub max_runtime_secs: Option<u64>,
    pub lease_ttl_secs: Option<u64>,
    pub shard_count: Option<u32>,
    pub interval_secs: Option<u64>,
    pub audit_log_retention_days: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ClickHouseConfig {
    pub url: Option<String>,
    pub table: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
