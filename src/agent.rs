use crate::jobs::types::{Credentials, MappingMode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Transport-level outcome of an agent call, before any interpretation of
/// what the agent said.
#[derive(Debug, Error)]
pub enum AgentCallError {
    #[error("agent request timed out")]
    Timeout,
    #[error("agent unreachable: {0}")]
    Unreachable(String),
    #[error("agent response was not understood: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupRequest {
    #[serde(rename = "jobId")]
    pub job_id: String,
    #[serde(rename = "runId")]
    pub run_id: String,
    pub sources: Vec<String>,
    pub destination: String,
    pub mode: MappingMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionConfig>,
    #[serde(rename = "logVerbosity")]
    pub log_verbosity: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RetentionConfig {
    pub index: u32,
    pub slots: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteTarget {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub path: String,
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobBackupsRequest {
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub mappings: Vec<JobBackupsMapping>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobBackupsMapping {
    pub label: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteBackup {
    pub path: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, alias = "modifiedAt", alias = "mtime")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, alias = "sizeBytes", alias = "totalBytes")]
    pub size: Option<u64>,
}

/// Counters extracted from a backup response, zeroed where the agent said
/// nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    #[serde(rename = "totalFiles")]
    pub total_files: u64,
    #[serde(rename = "copiedFiles")]
    pub copied_files: u64,
    #[serde(rename = "updatedFiles")]
    pub updated_files: u64,
    #[serde(rename = "skippedFiles")]
    pub skipped_files: u64,
    #[serde(rename = "failedFiles")]
    pub failed_files: u64,
    #[serde(rename = "bytesProcessed")]
    pub bytes_processed: u64,
}

impl TransferStats {
    /// The progress test used to decide fatal-vs-partial for destination
    /// errors. Skipped and blocked counts are intentionally not consulted.
    pub fn any_progress(&self) -> bool {
        self.bytes_processed > 0 || self.copied_files > 0 || self.updated_files > 0
    }

    pub fn merge(&mut self, other: &TransferStats) {
        self.total_files += other.total_files;
        self.copied_files += other.copied_files;
        self.updated_files += other.updated_files;
        self.skipped_files += other.skipped_files;
        self.failed_files += other.failed_files;
        self.bytes_processed += other.bytes_processed;
    }
}

/// What the agent reported about one backup call, in a fixed shape.
#[derive(Debug, Clone, Default)]
pub struct AgentReport {
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub stats: TransferStats,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub blocked_files: Vec<String>,
    pub log: Option<String>,
}

/// The three agent operations the engine depends on. A trait so the
/// executor can be driven against an in-process fake in tests.
#[async_trait]
pub trait BackupAgent: Send + Sync {
    async fn backup(
        &self,
        endpoint: &str,
        request: &BackupRequest,
    ) -> Result<AgentReport, AgentCallError>;

    async fn delete_paths(
        &self,
        endpoint: &str,
        targets: &[DeleteTarget],
    ) -> Result<Vec<DeleteOutcome>, AgentCallError>;

    async fn list_job_backups(
        &self,
        endpoint: &str,
        request: &JobBackupsRequest,
    ) -> Result<Vec<RemoteBackup>, AgentCallError>;
}

#[derive(Clone)]
pub struct HttpAgentClient {
    http: reqwest::Client,
    fs_timeout: Duration,
    backup_timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(fs_timeout_secs: u64, backup_timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            fs_timeout: Duration::from_secs(fs_timeout_secs),
            backup_timeout: Duration::from_secs(backup_timeout_secs),
        }
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}{}", endpoint.trim_end_matches('/'), path)
    }

    async fn post_json<B: Serialize>(
        &self,
        url: String,
        body: &B,
        timeout: Duration,
    ) -> Result<Value, AgentCallError> {
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?
            .error_for_status()
            .map_err(|e| AgentCallError::Unreachable(e.to_string()))?;
        response
            .json::<Value>()
            .await
            .map_err(|e| AgentCallError::Decode(e.to_string()))
    }
}

fn map_transport_error(err: reqwest::Error) -> AgentCallError {
    if err.is_timeout() {
        AgentCallError::Timeout
    } else {
        AgentCallError::Unreachable(err.to_string())
    }
}

#[async_trait]
impl BackupAgent for HttpAgentClient {
    async fn backup(
        &self,
        endpoint: &str,
        request: &BackupRequest,
    ) -> Result<AgentReport, AgentCallError> {
        let body = self
            .post_json(Self::url(endpoint, "/backup"), request, self.backup_timeout)
            .await?;
        Ok(normalize_backup_response(&body))
    }

    async fn delete_paths(
        &self,
        endpoint: &str,
        targets: &[DeleteTarget],
    ) -> Result<Vec<DeleteOutcome>, AgentCallError> {
        let body = serde_json::json!({ "targets": targets });
        let value = self
            .post_json(
                Self::url(endpoint, "/filesystem/delete"),
                &body,
                self.fs_timeout,
            )
            .await?;
        Ok(normalize_delete_response(&value, targets))
    }

    async fn list_job_backups(
        &self,
        endpoint: &str,
        request: &JobBackupsRequest,
    ) -> Result<Vec<RemoteBackup>, AgentCallError> {
        let value = self
            .post_json(Self::url(endpoint, "/backups/job"), request, self.backup_timeout)
            .await?;
        let items = value
            .get("backups")
            .or_else(|| value.get("results"))
            .cloned()
            .unwrap_or(value);
        serde_json::from_value(items).map_err(|e| AgentCallError::Decode(e.to_string()))
    }
}

// Candidate key spellings per statistic, most likely first. The agent's wire
// format has drifted across versions; probe rather than assume.
const SUCCESS_KEYS: &[&str] = &["success", "ok"];
const ERROR_CODE_KEYS: &[&str] = &["error_code", "errorCode", "code"];
const ERROR_MESSAGE_KEYS: &[&str] = &["error_message", "errorMessage", "error", "message"];
const TOTAL_FILES_KEYS: &[&str] = &["total_files", "totalFiles", "files_total", "fileCount"];
const COPIED_FILES_KEYS: &[&str] = &["copied_files", "copiedFiles", "files_copied", "copied"];
const UPDATED_FILES_KEYS: &[&str] = &["updated_files", "updatedFiles", "files_updated", "updated"];
const SKIPPED_FILES_KEYS: &[&str] = &["skipped_files", "skippedFiles", "files_skipped", "skipped"];
const FAILED_FILES_KEYS: &[&str] = &["failed_files", "failedFiles", "files_failed", "failed"];
const BYTES_KEYS: &[&str] = &[
    "bytes_processed",
    "bytesProcessed",
    "total_bytes",
    "totalBytes",
    "bytes",
];
const WARNINGS_KEYS: &[&str] = &["warnings"];
const ERRORS_KEYS: &[&str] = &["errors"];
const BLOCKED_KEYS: &[&str] = &["blocked_files", "blockedFiles", "blocked"];
const LOG_KEYS: &[&str] = &["log", "log_content", "logContent"];

pub fn normalize_backup_response(body: &Value) -> AgentReport {
    AgentReport {
        success: first_bool(body, SUCCESS_KEYS).unwrap_or(false),
        error_code: first_str(body, ERROR_CODE_KEYS),
        error_message: first_str(body, ERROR_MESSAGE_KEYS),
        stats: TransferStats {
            total_files: first_u64(body, TOTAL_FILES_KEYS),
            copied_files: first_u64(body, COPIED_FILES_KEYS),
            updated_files: first_u64(body, UPDATED_FILES_KEYS),
            skipped_files: first_u64(body, SKIPPED_FILES_KEYS),
            failed_files: first_u64(body, FAILED_FILES_KEYS),
            bytes_processed: first_u64(body, BYTES_KEYS),
        },
        warnings: string_list(body, WARNINGS_KEYS),
        errors: string_list(body, ERRORS_KEYS),
        blocked_files: string_list(body, BLOCKED_KEYS),
        log: first_str(body, LOG_KEYS),
    }
}

fn normalize_delete_response(value: &Value, targets: &[DeleteTarget]) -> Vec<DeleteOutcome> {
    let items = value
        .get("results")
        .and_then(Value::as_array)
        .or_else(|| value.as_array());
    let Some(items) = items else {
        // No per-path detail; treat every target as refused.
        return targets
            .iter()
            .map(|t| DeleteOutcome {
                path: t.path.clone(),
                ok: false,
                error: Some("agent returned no per-path results".to_string()),
            })
            .collect();
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let path = item
                .get("path")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| targets.get(i).map(|t| t.path.clone()))
                .unwrap_or_default();
            let status = item
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("error");
            let ok = matches!(status, "ok" | "deleted" | "success");
            DeleteOutcome {
                path,
                ok,
                error: item
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        })
        .collect()
}

/// Probe the `stats` sub-object first, then the response root.
fn lookup<'a>(body: &'a Value, key: &str) -> Option<&'a Value> {
    body.get("stats")
        .and_then(|stats| stats.get(key))
        .or_else(|| body.get(key))
}

fn first_u64(body: &Value, keys: &[&str]) -> u64 {
    keys.iter()
        .find_map(|key| lookup(body, key).and_then(value_as_u64))
        .unwrap_or(0)
}

fn value_as_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn first_bool(body: &Value, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| lookup(body, key).and_then(Value::as_bool))
}

fn first_str(body: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        lookup(body, key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn string_list(body: &Value, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .find_map(|key| lookup(body, key).and_then(Value::as_array))
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    item.as_str().map(str::to_string).or_else(|| {
                        // Some agent builds wrap entries as {"message": "..."}.
                        item.get("message")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
