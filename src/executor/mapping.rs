use crate::agent::{AgentReport, BackupAgent, BackupRequest, RetentionConfig};
use crate::error::{MappingError, MappingErrorKind};
use crate::executor::retention::{write_completion_marker, BackupMeta};
use crate::executor::types::{MappingResult, MappingStatus};
use crate::heartbeat::Heartbeat;
use crate::jobs::types::{validate_mapping, Mapping, MappingMode};
use chrono::Utc;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub(crate) struct MappingContext<'a> {
    pub job_id: &'a str,
    pub run_id: &'a str,
    pub index: usize,
    pub mapping: &'a Mapping,
    pub target_path: String,
    pub retention: Option<RetentionConfig>,
    pub log_verbosity: &'a str,
}

/// Run one mapping against the agent. Ok means a success or partial result;
/// Err is a hard failure the caller records (and, for unreachable agents,
/// escalates to abort the whole run).
pub(crate) async fn execute_mapping(
    agent: &dyn BackupAgent,
    heartbeat: &Heartbeat,
    ctx: MappingContext<'_>,
) -> Result<MappingResult, MappingError> {
    validate_mapping(ctx.mapping)?;

    let request = BackupRequest {
        job_id: ctx.job_id.to_string(),
        run_id: ctx.run_id.to_string(),
        sources: vec![ctx.mapping.source_path.clone()],
        destination: ctx.target_path.clone(),
        mode: ctx.mapping.mode,
        credentials: ctx.mapping.credentials.clone(),
        retention: ctx.retention,
        log_verbosity: ctx.log_verbosity.to_string(),
    };

    let report = match agent.backup(&heartbeat.endpoint(), &request).await {
        Ok(report) => {
            if let Some(log) = &report.log {
                debug!("agent log for mapping '{}':\n{}", ctx.mapping.label, log);
            }
            report
        }
        Err(call_err) => {
            // The HTTP call itself died. Before giving up, look at the
            // target directory: a crashed agent may have written plenty.
            return reconstruct_from_disk(&ctx, &call_err.to_string())
                .ok_or_else(|| mapping_error_from_call(&call_err).with_path(&ctx.target_path));
        }
    };

    if report.success {
        let mut result = MappingResult::new(
            ctx.index,
            ctx.mapping,
            ctx.target_path.clone(),
            if report.warnings.is_empty() && report.stats.failed_files == 0 {
                MappingStatus::Success
            } else {
                MappingStatus::Partial
            },
            report.stats,
        );
        result.warnings = report.warnings;
        result.errors = report.errors;
        if let Some(retention) = ctx.retention {
            result.retention_index = Some(retention.index);
        }
        if ctx.mapping.mode == MappingMode::Copy {
            finalize_copy_target(&ctx, &mut result);
        }
        return Ok(result);
    }

    // Agent answered but reported a failure.
    let code = report.error_code.as_deref().unwrap_or("");
    let kind = if code.is_empty() {
        MappingErrorKind::UnknownAgentError
    } else {
        MappingErrorKind::from_agent_code(code)
    };
    let message = report
        .error_message
        .clone()
        .unwrap_or_else(|| kind.user_message().to_string());

    if kind.is_fatal_destination() && !report.stats.any_progress() {
        // Nothing was written and the destination refused us: hard failure.
        return Err(MappingError::new(kind, message).with_path(&ctx.target_path));
    }

    // Data made it across despite the error, or the code is not in the
    // fatal set: keep the partial stats instead of discarding them.
    info!(
        "mapping '{}' downgraded to partial ({}: {})",
        ctx.mapping.label,
        kind.as_code(),
        message
    );
    Ok(partial_from_report(&ctx, report, kind, &message))
}

fn mapping_error_from_call(err: &crate::agent::AgentCallError) -> MappingError {
    use crate::agent::AgentCallError;
    match err {
        AgentCallError::Timeout => {
            MappingError::new(MappingErrorKind::AgentTimeout, err.to_string())
        }
        AgentCallError::Unreachable(_) => {
            MappingError::new(MappingErrorKind::AgentUnreachable, err.to_string())
        }
        AgentCallError::Decode(_) => {
            MappingError::new(MappingErrorKind::UnknownAgentError, err.to_string())
        }
    }
}

fn partial_from_report(
    ctx: &MappingContext<'_>,
    report: AgentReport,
    kind: MappingErrorKind,
    message: &str,
) -> MappingResult {
    let mut result = MappingResult::new(
        ctx.index,
        ctx.mapping,
        ctx.target_path.clone(),
        MappingStatus::Partial,
        report.stats,
    );
    result.warnings = report.warnings;
    result.errors = report.errors;
    result
        .errors
        .push(format!("{}: {}", kind.as_code(), message));
    for blocked in report.blocked_files {
        result.warnings.push(format!("blocked: {blocked}"));
    }
    if let Some(retention) = ctx.retention {
        result.retention_index = Some(retention.index);
    }
    result
}

/// The transport failed mid-call; recover visibility into whatever the
/// agent managed to write by measuring the target tree directly.
fn reconstruct_from_disk(ctx: &MappingContext<'_>, original_error: &str) -> Option<MappingResult> {
    let target = Path::new(&ctx.target_path);
    let (files, bytes) = measure_tree(target);
    if files == 0 && bytes == 0 {
        return None;
    }
    warn!(
        "agent call failed for mapping '{}' but {} files ({} bytes) found on disk, keeping partial result",
        ctx.mapping.label, files, bytes
    );
    let mut result = MappingResult::new(
        ctx.index,
        ctx.mapping,
        ctx.target_path.clone(),
        MappingStatus::Partial,
        crate::agent::TransferStats {
            total_files: files,
            copied_files: files,
            bytes_processed: bytes,
            ..Default::default()
        },
    );
    result.warnings.push(format!(
        "stats reconstructed from disk after agent call failed: {original_error}"
    ));
    if let Some(retention) = ctx.retention {
        result.retention_index = Some(retention.index);
    }
    Some(result)
}

/// Files and bytes under a directory tree. Unreadable entries are skipped;
/// this is an accounting pass, not an integrity check.
pub(crate) fn measure_tree(root: &Path) -> (u64, u64) {
    let mut files = 0u64;
    let mut bytes = 0u64;
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        files += 1;
        if let Ok(meta) = entry.metadata() {
            bytes += meta.len();
        }
    }
    (files, bytes)
}

fn finalize_copy_target(ctx: &MappingContext<'_>, result: &mut MappingResult) {
    let Some(retention) = ctx.retention else {
        return;
    };
    let meta = BackupMeta {
        job_id: ctx.job_id.to_string(),
        run_id: ctx.run_id.to_string(),
        retention_index: retention.index,
        slots: retention.slots,
        timestamp: Utc::now(),
    };
    if let Err(err) = write_completion_marker(Path::new(&ctx.target_path), &meta) {
        // The backup itself is fine; only later retention scans lose the
        // sidecar shortcut for this directory.
        warn!(
            "could not mark backup {} as complete: {}",
            ctx.target_path, err
        );
        result
            .warnings
            .push(format!("completion marker not written: {err}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn measures_nested_trees() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/one.bin"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("a/b/two.bin"), vec![0u8; 50]).unwrap();
        let (files, bytes) = measure_tree(dir.path());
        assert_eq!(files, 2);
        assert_eq!(bytes, 150);
    }

    #[test]
    fn empty_or_missing_tree_measures_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(measure_tree(dir.path()), (0, 0));
        assert_eq!(measure_tree(Path::new("/no/such/tree")), (0, 0));
    }
}
