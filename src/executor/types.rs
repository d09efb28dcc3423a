use crate::agent::TransferStats;
use crate::error::MappingError;
use crate::jobs::types::{Job, Mapping, MappingMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    Success,
    Partial,
    Failed,
}

/// One execution attempt of a job, covering all its mappings. Persisted
/// incrementally while running, immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "jobId")]
    pub job_id: String,
    #[serde(rename = "clientHostname")]
    pub client_hostname: String,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub mappings: Vec<MappingResult>,
    #[serde(rename = "bytesProcessed")]
    pub bytes_processed: u64,
    pub stats: TransferStats,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    #[serde(rename = "retentionStatus", default)]
    pub retention_status: Option<RetentionStatus>,
}

impl Run {
    pub fn new(run_id: String, job: &Job, start: DateTime<Utc>) -> Self {
        Self {
            run_id,
            job_id: job.job_id.clone(),
            client_hostname: job.client_hostname.clone(),
            start,
            end: None,
            status: RunStatus::Running,
            mappings: Vec::new(),
            bytes_processed: 0,
            stats: TransferStats::default(),
            warnings: Vec::new(),
            errors: Vec::new(),
            retention_status: None,
        }
    }

    pub fn duration_secs(&self) -> Option<i64> {
        self.end.map(|end| (end - self.start).num_seconds())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingResult {
    pub index: usize,
    pub label: String,
    #[serde(rename = "sourcePath")]
    pub source_path: String,
    #[serde(rename = "destinationPath")]
    pub destination_path: String,
    #[serde(rename = "targetPath")]
    pub target_path: String,
    pub mode: MappingMode,
    pub status: MappingStatus,
    #[serde(rename = "bytesProcessed")]
    pub bytes_processed: u64,
    pub stats: TransferStats,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    #[serde(rename = "retentionIndex", default)]
    pub retention_index: Option<u32>,
}

impl MappingResult {
    pub fn new(
        index: usize,
        mapping: &Mapping,
        target_path: String,
        status: MappingStatus,
        stats: TransferStats,
    ) -> Self {
        Self {
            index,
            label: mapping.label.clone(),
            source_path: mapping.source_path.clone(),
            destination_path: mapping.destination_path.clone(),
            target_path,
            mode: mapping.mode,
            status,
            bytes_processed: stats.bytes_processed,
            stats,
            warnings: Vec::new(),
            errors: Vec::new(),
            retention_index: None,
        }
    }

    /// A hard failure recorded in place so the run keeps a trace of the
    /// mapping even though nothing was transferred.
    pub fn from_error(index: usize, mapping: &Mapping, target_path: String, err: &MappingError) -> Self {
        let mut result = Self::new(
            index,
            mapping,
            target_path,
            MappingStatus::Failed,
            TransferStats::default(),
        );
        result.errors.push(err.to_string());
        result
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionStatus {
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub deleted: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}

impl RetentionStatus {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            applied: false,
            reason: Some(reason.into()),
            deleted: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn applied() -> Self {
        Self {
            applied: true,
            reason: None,
            deleted: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// failed > partial > success, evaluated after every mapping was attempted.
pub fn derive_run_status(run: &Run) -> RunStatus {
    if run.mappings.is_empty() {
        // Defensive: a run with no mapping results at all. Judge from the
        // aggregate lists with the same precedence.
        return if !run.errors.is_empty() {
            RunStatus::Failed
        } else if !run.warnings.is_empty() {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };
    }
    if run
        .mappings
        .iter()
        .any(|m| m.status == MappingStatus::Failed)
    {
        RunStatus::Failed
    } else if run
        .mappings
        .iter()
        .any(|m| m.status == MappingStatus::Partial)
    {
        RunStatus::Partial
    } else {
        RunStatus::Success
    }
}
