use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    /// Directory holding jobs.json, heartbeats.json and the runs/ folder.
    pub data_dir: PathBuf,
    /// Seconds after which a heartbeat is considered stale.
    pub heartbeat_ttl_secs: i64,
    /// Timeout for agent filesystem/listing calls.
    pub agent_fs_timeout_secs: u64,
    /// Timeout for agent backup calls.
    pub agent_backup_timeout_secs: u64,
    /// Scheduler sleep when nothing is scheduled at all.
    pub idle_sleep_secs: u64,
    /// Lower bound on any scheduler sleep.
    pub min_check_interval_secs: u64,
    /// Wake this many seconds before the nearest run to absorb wake latency.
    pub wake_anticipation_secs: i64,
    /// Versions kept per copy-mode mapping when the job does not say.
    pub default_retention_slots: u32,
    /// Verbosity forwarded to the agent in every backup request.
    pub agent_log_verbosity: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            heartbeat_ttl_secs: 120,
            agent_fs_timeout_secs: 10,
            agent_backup_timeout_secs: 15,
            idle_sleep_secs: 300,
            min_check_interval_secs: 10,
            wake_anticipation_secs: 5,
            default_retention_slots: 5,
            agent_log_verbosity: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load the config file, writing a default one on first run. The data
    /// directory can be overridden with BACKPLANE_DATA_DIR.
    pub fn load() -> Result<Self> {
        let path = config_path();
        let mut cfg = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config at {}", path.display()))?
        } else {
            let cfg = Self::default();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, serde_json::to_string_pretty(&cfg)?)?;
            cfg
        };

        if let Ok(dir) = std::env::var("BACKPLANE_DATA_DIR") {
            if !dir.trim().is_empty() {
                cfg.data_dir = PathBuf::from(dir);
            }
        }
        fs::create_dir_all(&cfg.data_dir)
            .with_context(|| format!("failed to create data dir {}", cfg.data_dir.display()))?;
        Ok(cfg)
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("backplane")
        .join("config.json")
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("backplane")
}
