use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;
use tracing::warn;

/// Marker dropped into a backup directory once the agent finished writing
/// it; a directory without one is either mid-write or from a crashed run.
pub const COMPLETION_MARKER: &str = ".backup-complete";
/// Sidecar describing who wrote the backup; authoritative for retention.
pub const META_SIDECAR: &str = ".backup-meta.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMeta {
    #[serde(rename = "jobId")]
    pub job_id: String,
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "retentionIndex")]
    pub retention_index: u32,
    pub slots: u32,
    pub timestamp: DateTime<Utc>,
}

/// One discovered historical backup directory.
#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub mtime: SystemTime,
    pub retention_index: Option<u32>,
}

/// Per-mapping view of what already exists, captured once at run start
/// before anything is written or deleted.
#[derive(Debug, Clone)]
pub struct RetentionSnapshot {
    pub slots: u32,
    /// Oldest first by mtime.
    pub existing: Vec<BackupEntry>,
}

impl RetentionSnapshot {
    /// Index the backup produced by this run will carry.
    pub fn next_index(&self) -> u32 {
        self.existing
            .iter()
            .filter_map(|e| e.retention_index)
            .max()
            .unwrap_or(self.existing.len() as u32)
            + 1
    }
}

/// Directory name for a new copy-mode backup.
pub fn target_dir_name(job_id: &str, start: DateTime<Utc>) -> String {
    format!("bk_{}_{}", job_id, start.format("%Y%m%d%H%M%S"))
}

// Naming schemes older installations used before the sidecar existed. Kept
// as read-only fallbacks; anything this engine writes carries a sidecar.
fn legacy_dated_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^backup[-_]\d{4}-\d{2}-\d{2}[-_ T]\d{2}[-.]\d{2}[-.]\d{2}$").unwrap()
    })
}

fn legacy_versioned_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^.+_v(\d+)$").unwrap())
}

fn current_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^bk_.+_\d{14}$").unwrap())
}

/// Scan a mapping destination for existing backups: directories matching a
/// known naming scheme, or carrying the metadata sidecar. Sorted oldest
/// first by mtime.
pub fn scan_existing_backups(destination: &Path) -> Result<Vec<BackupEntry>> {
    let mut entries = Vec::new();
    if !destination.exists() {
        return Ok(entries);
    }
    let read = fs::read_dir(destination)
        .with_context(|| format!("failed to list {}", destination.display()))?;
    for entry in read {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();

        let mut retention_index = None;
        let mut recognized = current_name_re().is_match(&name) || legacy_dated_re().is_match(&name);
        if let Some(captures) = legacy_versioned_re().captures(&name) {
            recognized = true;
            retention_index = captures.get(1).and_then(|m| m.as_str().parse().ok());
        }

        match read_sidecar(&path) {
            Some(meta) => {
                recognized = true;
                retention_index = Some(meta.retention_index);
            }
            None if !recognized => continue,
            None => {}
        }

        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push(BackupEntry {
            path,
            mtime,
            retention_index,
        });
    }
    entries.sort_by_key(|e| e.mtime);
    Ok(entries)
}

fn read_sidecar(dir: &Path) -> Option<BackupMeta> {
    let sidecar = dir.join(META_SIDECAR);
    if !sidecar.exists() {
        return None;
    }
    let content = fs::read_to_string(&sidecar).ok()?;
    match serde_json::from_str(&content) {
        Ok(meta) => Some(meta),
        Err(err) => {
            warn!("unreadable backup sidecar at {}: {}", sidecar.display(), err);
            None
        }
    }
}

/// Which existing backups must go so that, counting the one this run just
/// produced, at most `slots` remain. Oldest first.
pub fn plan_rotation(existing: &[BackupEntry], slots: u32) -> Vec<BackupEntry> {
    let total = existing.len() + 1;
    let excess = total.saturating_sub(slots.max(1) as usize);
    existing.iter().take(excess).cloned().collect()
}

/// Drop the completion marker and metadata sidecar into a finished backup
/// directory.
pub fn write_completion_marker(target: &Path, meta: &BackupMeta) -> Result<()> {
    fs::write(
        target.join(META_SIDECAR),
        serde_json::to_string_pretty(meta)?,
    )
    .with_context(|| format!("failed to write sidecar in {}", target.display()))?;
    fs::write(
        target.join(COMPLETION_MARKER),
        meta.timestamp.to_rfc3339(),
    )
    .with_context(|| format!("failed to write marker in {}", target.display()))?;
    Ok(())
}
