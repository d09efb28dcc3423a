use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

/// Backup progress last stamped on a host, either by the agent itself or by
/// the executor when a run starts and finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPhase {
    InProgress,
    Completed,
    Partial,
    Failed,
}

impl BackupPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub hostname: String,
    pub status: AgentStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "agentIp")]
    pub agent_ip: String,
    #[serde(rename = "agentPort")]
    pub agent_port: u16,
    #[serde(rename = "backupStatus", default)]
    pub backup_status: Option<BackupPhase>,
    #[serde(rename = "backupJobId", default)]
    pub backup_job_id: Option<String>,
    #[serde(rename = "backupStatusTimestamp", default)]
    pub backup_status_timestamp: Option<DateTime<Utc>>,
}

impl Heartbeat {
    /// Online means the agent did not report itself offline and its last
    /// ping is within the TTL.
    pub fn is_online(&self, now: DateTime<Utc>, ttl_secs: i64) -> bool {
        self.status != AgentStatus::Offline
            && (now - self.timestamp).num_seconds() <= ttl_secs
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.agent_ip, self.agent_port)
    }

    pub fn set_backup_phase(&mut self, phase: BackupPhase, job_id: &str, now: DateTime<Utc>) {
        self.backup_status = Some(phase);
        self.backup_job_id = Some(job_id.to_string());
        self.backup_status_timestamp = Some(now);
    }
}

/// JSON map of hostname to last heartbeat. Written by inbound agent pings
/// (outside this engine) and by the executor stamping backup progress;
/// writes are whole snapshots, so last-writer-wins is fine.
#[derive(Clone)]
pub struct HeartbeatStore {
    path: PathBuf,
}

impl HeartbeatStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            path: data_dir.join("heartbeats.json"),
        }
    }

    pub fn load(&self, hostname: &str) -> Result<Option<Heartbeat>> {
        Ok(self.load_map()?.remove(hostname))
    }

    pub fn load_all(&self) -> Result<Vec<Heartbeat>> {
        let mut all: Vec<Heartbeat> = self.load_map()?.into_values().collect();
        all.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(all)
    }

    pub fn save(&self, heartbeat: &Heartbeat) -> Result<()> {
        let mut map = self.load_map()?;
        map.insert(heartbeat.hostname.clone(), heartbeat.clone());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&map)?)?;
        Ok(())
    }

    fn load_map(&self) -> Result<HashMap<String, Heartbeat>> {
        if self.path.exists() {
            let content = fs::read_to_string(&self.path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(HashMap::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn heartbeat(status: AgentStatus, age_secs: i64, now: DateTime<Utc>) -> Heartbeat {
        Heartbeat {
            hostname: "client-01".to_string(),
            status,
            timestamp: now - Duration::seconds(age_secs),
            agent_ip: "10.0.0.12".to_string(),
            agent_port: 8750,
            backup_status: None,
            backup_job_id: None,
            backup_status_timestamp: None,
        }
    }

    #[test]
    fn fresh_online_heartbeat_is_online() {
        let now = Utc::now();
        assert!(heartbeat(AgentStatus::Online, 30, now).is_online(now, 120));
    }

    #[test]
    fn stale_heartbeat_is_offline() {
        let now = Utc::now();
        assert!(!heartbeat(AgentStatus::Online, 121, now).is_online(now, 120));
    }

    #[test]
    fn explicit_offline_wins_even_when_fresh() {
        let now = Utc::now();
        assert!(!heartbeat(AgentStatus::Offline, 5, now).is_online(now, 120));
    }

    #[test]
    fn store_round_trips_and_stamps() {
        let dir = tempfile::tempdir().unwrap();
        let store = HeartbeatStore::new(dir.path().to_path_buf());
        let now = Utc::now();
        let mut hb = heartbeat(AgentStatus::Online, 0, now);
        hb.set_backup_phase(BackupPhase::InProgress, "job-1", now);
        store.save(&hb).unwrap();

        let loaded = store.load("client-01").unwrap().unwrap();
        assert_eq!(loaded.backup_status, Some(BackupPhase::InProgress));
        assert_eq!(loaded.backup_job_id.as_deref(), Some("job-1"));
        assert!(store.load("unknown-host").unwrap().is_none());
    }
}
