pub mod mapping;
pub mod retention;
pub mod types;

use crate::agent::{BackupAgent, DeleteTarget, RetentionConfig, TransferStats};
use crate::config::AppConfig;
use crate::error::{ExecError, ExecResult, MappingError, MappingErrorKind};
use crate::executor::mapping::MappingContext;
use crate::executor::retention::{scan_existing_backups, target_dir_name, RetentionSnapshot};
use crate::executor::types::{derive_run_status, MappingResult, RetentionStatus, Run, RunStatus};
use crate::heartbeat::{BackupPhase, Heartbeat, HeartbeatStore};
use crate::jobs::types::{Job, MappingMode};
use crate::notify::{condition_key, Notifier};
use crate::runs::RunStore;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

struct ExecutorInner {
    cfg: AppConfig,
    agent: Arc<dyn BackupAgent>,
    runs: RunStore,
    heartbeats: HeartbeatStore,
    notifier: Arc<dyn Notifier>,
    /// job_id -> run_id of the in-flight run. The engine's only concurrency
    /// control: independent jobs run freely, one run per job at a time.
    running: Arc<Mutex<HashMap<String, String>>>,
    /// job_id -> condition key of the last non-success run, for
    /// new-vs-repeat alert detection.
    active_alerts: Mutex<HashMap<String, String>>,
}

#[derive(Clone)]
pub struct JobExecutor {
    inner: Arc<ExecutorInner>,
}

/// Releases the single-flight slot on every exit path.
struct RunGuard {
    running: Arc<Mutex<HashMap<String, String>>>,
    job_id: String,
}

impl RunGuard {
    fn acquire(
        running: &Arc<Mutex<HashMap<String, String>>>,
        job_id: &str,
        run_id: &str,
    ) -> ExecResult<Self> {
        let mut map = running.lock().unwrap();
        if map.contains_key(job_id) {
            return Err(ExecError::JobRunning(job_id.to_string()));
        }
        map.insert(job_id.to_string(), run_id.to_string());
        Ok(Self {
            running: Arc::clone(running),
            job_id: job_id.to_string(),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.running.lock() {
            map.remove(&self.job_id);
        }
    }
}

impl JobExecutor {
    pub fn new(cfg: AppConfig, agent: Arc<dyn BackupAgent>, notifier: Arc<dyn Notifier>) -> Self {
        let runs = RunStore::new(cfg.data_dir.clone());
        let heartbeats = HeartbeatStore::new(cfg.data_dir.clone());
        Self {
            inner: Arc::new(ExecutorInner {
                cfg,
                agent,
                runs,
                heartbeats,
                notifier,
                running: Arc::new(Mutex::new(HashMap::new())),
                active_alerts: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn run_store(&self) -> &RunStore {
        &self.inner.runs
    }

    pub fn heartbeat_store(&self) -> &HeartbeatStore {
        &self.inner.heartbeats
    }

    /// Execute one job to completion: every mapping in declared order, then
    /// status derivation, retention rotation and notifications. Returns the
    /// terminal run, or the error that aborted it (the run record is
    /// persisted either way).
    pub async fn execute_job(&self, job: &Job) -> ExecResult<Run> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let _guard = RunGuard::acquire(&self.inner.running, &job.job_id, &run_id)?;

        info!("starting run {} for job '{}'", run_id, job.name);
        let mut run = Run::new(run_id, job, Utc::now());
        self.inner.runs.save(&run)?;
        self.stamp_heartbeat(job, BackupPhase::InProgress);

        // Captured before anything is written or deleted; rotation at the
        // end of the run works against this view.
        let snapshots = self.snapshot_retention(job);

        match self.drive_mappings(job, &mut run, &snapshots).await {
            Ok(()) => {
                aggregate_stats(&mut run);
                run.status = derive_run_status(&run);
                run.end = Some(Utc::now());
                run.retention_status = Some(self.apply_retention(job, &run, &snapshots).await);
                self.finish_run(job, &run)?;
                self.notify_finished(job, &run).await;
                Ok(run)
            }
            Err(err) => {
                aggregate_stats(&mut run);
                run.status = RunStatus::Failed;
                run.end = Some(Utc::now());
                run.retention_status =
                    Some(RetentionStatus::skipped("run did not succeed"));
                let error_path = match &err {
                    ExecError::Mapping { source, .. } => source.path.clone(),
                    _ => None,
                };
                self.rollback(job, &run, error_path.as_deref()).await;
                self.finish_run(job, &run)?;
                self.notify_finished(job, &run).await;
                Err(err)
            }
        }
    }

    /// Run every mapping in order, persisting the run after each one. A
    /// hard mapping failure is recorded and the loop continues; an
    /// unreachable agent aborts the rest of the job.
    async fn drive_mappings(
        &self,
        job: &Job,
        run: &mut Run,
        snapshots: &HashMap<usize, RetentionSnapshot>,
    ) -> ExecResult<()> {
        for (index, mapping) in job.mappings.iter().enumerate() {
            let heartbeat = match self.reachable_heartbeat(&job.client_hostname) {
                Ok(hb) => hb,
                Err(err) => {
                    run.errors.push(err.to_string());
                    return Err(ExecError::Mapping {
                        label: mapping.label.clone(),
                        source: err,
                    });
                }
            };

            let target_path = match mapping.mode {
                MappingMode::Copy => Path::new(&mapping.destination_path)
                    .join(target_dir_name(&job.job_id, run.start))
                    .to_string_lossy()
                    .into_owned(),
                MappingMode::Sync => mapping.destination_path.clone(),
            };
            let retention = snapshots.get(&index).map(|s| RetentionConfig {
                index: s.next_index(),
                slots: s.slots,
            });

            let ctx = MappingContext {
                job_id: &job.job_id,
                run_id: &run.run_id,
                index,
                mapping,
                target_path: target_path.clone(),
                retention,
                log_verbosity: &self.inner.cfg.agent_log_verbosity,
            };

            match mapping::execute_mapping(self.inner.agent.as_ref(), &heartbeat, ctx).await {
                Ok(result) => run.mappings.push(result),
                Err(err) if err.kind.aborts_run() => {
                    run.errors.push(err.to_string());
                    return Err(ExecError::Mapping {
                        label: mapping.label.clone(),
                        source: err,
                    });
                }
                Err(err) => {
                    warn!("mapping '{}' failed: {}", mapping.label, err);
                    run.mappings
                        .push(MappingResult::from_error(index, mapping, target_path, &err));
                }
            }

            aggregate_stats(run);
            self.inner.runs.save(run)?;
        }
        Ok(())
    }

    fn snapshot_retention(&self, job: &Job) -> HashMap<usize, RetentionSnapshot> {
        let mut snapshots = HashMap::new();
        for (index, mapping) in job.mappings.iter().enumerate() {
            if mapping.mode != MappingMode::Copy {
                continue;
            }
            let existing = match scan_existing_backups(Path::new(&mapping.destination_path)) {
                Ok(existing) => existing,
                Err(err) => {
                    warn!(
                        "could not scan existing backups for '{}': {}",
                        mapping.label, err
                    );
                    Vec::new()
                }
            };
            let slots = mapping
                .retention
                .map(|r| r.max_backups)
                .filter(|slots| *slots > 0)
                .unwrap_or(self.inner.cfg.default_retention_slots);
            snapshots.insert(index, RetentionSnapshot { slots, existing });
        }
        snapshots
    }

    fn reachable_heartbeat(&self, hostname: &str) -> Result<Heartbeat, MappingError> {
        match self.inner.heartbeats.load(hostname) {
            Ok(Some(hb)) => {
                if hb.is_online(Utc::now(), self.inner.cfg.heartbeat_ttl_secs) {
                    Ok(hb)
                } else {
                    Err(MappingError::new(
                        MappingErrorKind::AgentUnreachable,
                        format!("heartbeat for {hostname} is stale or offline"),
                    ))
                }
            }
            Ok(None) => Err(MappingError::new(
                MappingErrorKind::AgentUnreachable,
                format!("no heartbeat recorded for {hostname}"),
            )),
            Err(err) => Err(MappingError::new(
                MappingErrorKind::AgentUnreachable,
                format!("could not read heartbeat for {hostname}: {err}"),
            )),
        }
    }

    /// Keep the newest `slots` backups per copy mapping, new one included;
    /// deletions go through the agent and failures never fail the run.
    async fn apply_retention(
        &self,
        job: &Job,
        run: &Run,
        snapshots: &HashMap<usize, RetentionSnapshot>,
    ) -> RetentionStatus {
        if run.status == RunStatus::Failed {
            return RetentionStatus::skipped("run did not succeed");
        }
        if saw_access_error(run) {
            return RetentionStatus::skipped("credential or access errors during run");
        }

        let mut status = RetentionStatus::applied();
        for result in &run.mappings {
            if result.mode != MappingMode::Copy {
                continue;
            }
            let Some(snapshot) = snapshots.get(&result.index) else {
                continue;
            };
            let doomed = retention::plan_rotation(&snapshot.existing, snapshot.slots);
            if doomed.is_empty() {
                continue;
            }
            let mapping = &job.mappings[result.index];
            let targets: Vec<DeleteTarget> = doomed
                .iter()
                .map(|entry| DeleteTarget {
                    path: entry.path.to_string_lossy().into_owned(),
                    credentials: mapping.credentials.clone(),
                })
                .collect();
            match self.delete_via_agent(job, &targets).await {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        if outcome.ok {
                            info!("retention deleted {}", outcome.path);
                            status.deleted.push(outcome.path);
                        } else {
                            warn!(
                                "retention could not delete {}: {}",
                                outcome.path,
                                outcome.error.as_deref().unwrap_or("unknown error")
                            );
                            status.failed.push(outcome.path);
                        }
                    }
                }
                Err(err) => {
                    warn!("retention delete call failed: {}", err);
                    status
                        .failed
                        .extend(targets.into_iter().map(|t| t.path));
                }
            }
        }
        status
    }

    /// Best effort: remove the half-written backup directories of an
    /// aborted run so later retention scans do not count them as versions.
    async fn rollback(&self, job: &Job, run: &Run, error_path: Option<&Path>) {
        let mut targets: Vec<String> = run
            .mappings
            .iter()
            .filter(|m| m.mode == MappingMode::Copy)
            .map(|m| m.target_path.clone())
            .collect();
        if let Some(path) = error_path {
            targets.push(path.to_string_lossy().into_owned());
        }
        targets.sort();
        targets.dedup();
        if targets.is_empty() {
            return;
        }

        warn!(
            "rolling back {} attempted backup path(s) for job '{}'",
            targets.len(),
            job.name
        );
        let delete_targets: Vec<DeleteTarget> = targets
            .into_iter()
            .map(|path| DeleteTarget {
                path,
                credentials: None,
            })
            .collect();
        match self.delete_via_agent(job, &delete_targets).await {
            Ok(outcomes) => {
                for outcome in outcomes.iter().filter(|o| !o.ok) {
                    error!(
                        "rollback could not delete {}: {}",
                        outcome.path,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            Err(err) => error!("rollback delete call failed: {}", err),
        }
    }

    async fn delete_via_agent(
        &self,
        job: &Job,
        targets: &[DeleteTarget],
    ) -> Result<Vec<crate::agent::DeleteOutcome>, MappingError> {
        let heartbeat = self.reachable_heartbeat(&job.client_hostname)?;
        self.inner
            .agent
            .delete_paths(&heartbeat.endpoint(), targets)
            .await
            .map_err(|err| MappingError::new(MappingErrorKind::AgentUnreachable, err.to_string()))
    }

    fn finish_run(&self, job: &Job, run: &Run) -> ExecResult<()> {
        self.inner.runs.save(run)?;
        let phase = match run.status {
            RunStatus::Success => BackupPhase::Completed,
            RunStatus::Partial => BackupPhase::Partial,
            _ => BackupPhase::Failed,
        };
        self.stamp_heartbeat(job, phase);
        info!(
            "run {} for job '{}' finished: {}",
            run.run_id,
            job.name,
            run.status.as_str()
        );
        Ok(())
    }

    /// Invoke the notifier with new-vs-repeat detection.
    async fn notify_finished(&self, job: &Job, run: &Run) {
        let key = condition_key(run);
        let is_new = {
            let mut alerts = self.inner.active_alerts.lock().unwrap();
            match &key {
                Some(key) => {
                    let is_new = alerts.get(&job.job_id) != Some(key);
                    alerts.insert(job.job_id.clone(), key.clone());
                    is_new
                }
                None => {
                    alerts.remove(&job.job_id);
                    false
                }
            }
        };
        self.inner.notifier.run_finished(job, run, is_new).await;
    }

    fn stamp_heartbeat(&self, job: &Job, phase: BackupPhase) {
        match self.inner.heartbeats.load(&job.client_hostname) {
            Ok(Some(mut hb)) => {
                hb.set_backup_phase(phase, &job.job_id, Utc::now());
                if let Err(err) = self.inner.heartbeats.save(&hb) {
                    warn!(
                        "could not stamp heartbeat for {}: {}",
                        job.client_hostname, err
                    );
                }
            }
            Ok(None) => {}
            Err(err) => warn!(
                "could not read heartbeat for {}: {}",
                job.client_hostname, err
            ),
        }
    }
}

fn aggregate_stats(run: &mut Run) {
    let mut stats = TransferStats::default();
    for mapping in &run.mappings {
        stats.merge(&mapping.stats);
    }
    run.stats = stats;
    run.bytes_processed = stats.bytes_processed;
}

/// True when any mapping recorded a credentials/access refusal; retention
/// must not delete anything on such runs.
fn saw_access_error(run: &Run) -> bool {
    run.mappings.iter().any(|m| {
        m.errors.iter().any(|e| {
            e.starts_with(MappingErrorKind::AccessDenied.as_code())
                || e.starts_with(MappingErrorKind::InvalidCredentials.as_code())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{
        AgentCallError, AgentReport, BackupRequest, DeleteOutcome, JobBackupsRequest, RemoteBackup,
    };
    use crate::executor::retention::{write_completion_marker, BackupMeta};
    use crate::executor::types::MappingStatus;
    use crate::heartbeat::AgentStatus;
    use crate::jobs::types::{Mapping, Retention, Schedule};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::fs;
    use std::time::Duration;

    struct Step {
        outcome: Result<AgentReport, AgentCallError>,
        /// Files the fake agent drops into the destination before
        /// answering, like the real one does while copying.
        write_files: usize,
        file_size: usize,
    }

    fn step(outcome: Result<AgentReport, AgentCallError>) -> Step {
        Step {
            outcome,
            write_files: 0,
            file_size: 0,
        }
    }

    struct ScriptedAgent {
        steps: Mutex<VecDeque<Step>>,
        deleted: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl ScriptedAgent {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                deleted: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn deleted_paths(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }

        fn remaining_steps(&self) -> usize {
            self.steps.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl BackupAgent for ScriptedAgent {
        async fn backup(
            &self,
            _endpoint: &str,
            request: &BackupRequest,
        ) -> Result<AgentReport, AgentCallError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| step(Ok(ok_report(0, 0))));
            if next.write_files > 0 {
                let dir = Path::new(&request.destination);
                fs::create_dir_all(dir).unwrap();
                for i in 0..next.write_files {
                    fs::write(dir.join(format!("f{i}.bin")), vec![0u8; next.file_size]).unwrap();
                }
            }
            next.outcome
        }

        async fn delete_paths(
            &self,
            _endpoint: &str,
            targets: &[DeleteTarget],
        ) -> Result<Vec<DeleteOutcome>, AgentCallError> {
            let mut deleted = self.deleted.lock().unwrap();
            Ok(targets
                .iter()
                .map(|t| {
                    deleted.push(t.path.clone());
                    DeleteOutcome {
                        path: t.path.clone(),
                        ok: true,
                        error: None,
                    }
                })
                .collect())
        }

        async fn list_job_backups(
            &self,
            _endpoint: &str,
            _request: &JobBackupsRequest,
        ) -> Result<Vec<RemoteBackup>, AgentCallError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(RunStatus, bool)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn run_finished(&self, _job: &Job, run: &Run, is_new_condition: bool) {
            self.calls.lock().unwrap().push((run.status, is_new_condition));
        }
    }

    fn ok_report(files: u64, bytes: u64) -> AgentReport {
        AgentReport {
            success: true,
            stats: TransferStats {
                total_files: files,
                copied_files: files,
                bytes_processed: bytes,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn failure_report(code: &str, bytes: u64, copied: u64) -> AgentReport {
        AgentReport {
            success: false,
            error_code: Some(code.to_string()),
            error_message: Some("refused".to_string()),
            stats: TransferStats {
                copied_files: copied,
                bytes_processed: bytes,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct Harness {
        _data: tempfile::TempDir,
        _dest: tempfile::TempDir,
        executor: JobExecutor,
        agent: Arc<ScriptedAgent>,
        notifier: Arc<RecordingNotifier>,
        job: Job,
    }

    fn mapping(label: &str, destination: &Path) -> Mapping {
        Mapping {
            label: label.to_string(),
            source_path: format!("\\\\client-01\\share\\{label}"),
            destination_path: destination.to_string_lossy().into_owned(),
            mode: MappingMode::Copy,
            retention: Some(Retention { max_backups: 5 }),
            credentials: None,
        }
    }

    fn harness(agent: ScriptedAgent, labels: &[&str]) -> Harness {
        let data = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let cfg = AppConfig {
            data_dir: data.path().to_path_buf(),
            ..Default::default()
        };
        let agent = Arc::new(agent);
        let notifier = Arc::new(RecordingNotifier::default());
        let executor = JobExecutor::new(cfg, agent.clone(), notifier.clone());

        executor
            .heartbeat_store()
            .save(&Heartbeat {
                hostname: "client-01".to_string(),
                status: AgentStatus::Online,
                timestamp: Utc::now(),
                agent_ip: "10.0.0.12".to_string(),
                agent_port: 8750,
                backup_status: None,
                backup_job_id: None,
                backup_status_timestamp: None,
            })
            .unwrap();

        let mappings: Vec<Mapping> = labels
            .iter()
            .map(|label| {
                let destination = dest.path().join(label);
                fs::create_dir_all(&destination).unwrap();
                mapping(label, &destination)
            })
            .collect();
        let job = Job {
            job_id: "job-1".to_string(),
            name: "nightly docs".to_string(),
            client_hostname: "client-01".to_string(),
            enabled: true,
            mode_default: MappingMode::Copy,
            schedule: Schedule::Daily {
                days: None,
                times: vec!["02:00".to_string()],
            },
            mappings,
        };

        Harness {
            _data: data,
            _dest: dest,
            executor,
            agent,
            notifier,
            job,
        }
    }

    fn seed_existing_backups(destination: &Path, count: u32) {
        for i in 0..count {
            let dir = destination.join(format!("bk_job-1_2025010{i}020000"));
            fs::create_dir_all(&dir).unwrap();
            let meta = BackupMeta {
                job_id: "job-1".to_string(),
                run_id: format!("old-run-{i}"),
                retention_index: i + 1,
                slots: 5,
                timestamp: Utc::now(),
            };
            write_completion_marker(&dir, &meta).unwrap();
            // Distinct mtimes so rotation order is well defined.
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[tokio::test]
    async fn successful_run_rotates_down_to_slot_count() {
        let h = harness(
            ScriptedAgent::new(vec![Step {
                outcome: Ok(ok_report(10, 4096)),
                write_files: 2,
                file_size: 16,
            }]),
            &["docs"],
        );
        let destination = Path::new(&h.job.mappings[0].destination_path).to_path_buf();
        seed_existing_backups(&destination, 7);

        let run = h.executor.execute_job(&h.job).await.unwrap();

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.mappings.len(), 1);
        assert_eq!(run.mappings[0].retention_index, Some(8));
        assert_eq!(run.bytes_processed, 4096);

        let retention = run.retention_status.clone().unwrap();
        assert!(retention.applied);
        assert_eq!(retention.deleted.len(), 3);
        assert!(retention.failed.is_empty());
        // Oldest three by mtime are the first three seeded.
        for i in 0..3 {
            assert!(retention
                .deleted
                .iter()
                .any(|p| p.ends_with(&format!("bk_job-1_2025010{i}020000"))));
        }
        assert_eq!(h.agent.deleted_paths().len(), 3);

        // The new backup directory carries the sidecar and marker.
        let target = Path::new(&run.mappings[0].target_path);
        assert!(target.join(retention::META_SIDECAR).exists());
        assert!(target.join(retention::COMPLETION_MARKER).exists());

        let stored = h.executor.run_store().load(&run.run_id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        let hb = h
            .executor
            .heartbeat_store()
            .load("client-01")
            .unwrap()
            .unwrap();
        assert_eq!(hb.backup_status, Some(BackupPhase::Completed));
    }

    #[tokio::test]
    async fn second_concurrent_execution_is_rejected() {
        let h = harness(
            ScriptedAgent::new(vec![Step {
                outcome: Ok(ok_report(1, 10)),
                write_files: 1,
                file_size: 10,
            }])
            .with_delay(Duration::from_millis(200)),
            &["docs"],
        );

        let (a, b) = tokio::join!(
            h.executor.execute_job(&h.job),
            h.executor.execute_job(&h.job)
        );
        let (winner, loser) = match (a, b) {
            (Ok(run), Err(err)) => (run, err),
            (Err(err), Ok(run)) => (run, err),
            other => panic!("expected exactly one rejection, got {other:?}"),
        };
        assert!(matches!(loser, ExecError::JobRunning(_)));

        let runs = h.executor.run_store().list_recent(10, None).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, winner.run_id);
    }

    #[tokio::test]
    async fn access_denied_without_progress_fails_hard() {
        let h = harness(
            ScriptedAgent::new(vec![step(Ok(failure_report("ACCESS_DENIED", 0, 0)))]),
            &["docs"],
        );
        let run = h.executor.execute_job(&h.job).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.mappings[0].status, MappingStatus::Failed);
        assert!(run.mappings[0].errors[0].starts_with("ACCESS_DENIED"));
        assert!(!run.retention_status.unwrap().applied);
        assert_eq!(
            h.notifier.calls.lock().unwrap().as_slice(),
            &[(RunStatus::Failed, true)]
        );
    }

    #[tokio::test]
    async fn access_denied_with_progress_downgrades_to_partial() {
        let h = harness(
            ScriptedAgent::new(vec![step(Ok(failure_report("ACCESS_DENIED", 2048, 3)))]),
            &["docs"],
        );
        let run = h.executor.execute_job(&h.job).await.unwrap();

        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.mappings[0].status, MappingStatus::Partial);
        // Partial stats preserved, not discarded.
        assert_eq!(run.mappings[0].stats.copied_files, 3);
        assert_eq!(run.bytes_processed, 2048);

        // Access errors veto retention even on a partial run.
        let retention = run.retention_status.unwrap();
        assert!(!retention.applied);
        assert!(retention.reason.unwrap().contains("access"));
    }

    #[tokio::test]
    async fn repeated_identical_failure_is_not_a_new_condition() {
        let h = harness(
            ScriptedAgent::new(vec![
                step(Ok(failure_report("ACCESS_DENIED", 0, 0))),
                step(Ok(failure_report("ACCESS_DENIED", 0, 0))),
            ]),
            &["docs"],
        );
        h.executor.execute_job(&h.job).await.unwrap();
        h.executor.execute_job(&h.job).await.unwrap();

        assert_eq!(
            h.notifier.calls.lock().unwrap().as_slice(),
            &[(RunStatus::Failed, true), (RunStatus::Failed, false)]
        );
    }

    #[tokio::test]
    async fn crashed_agent_call_reconstructs_partial_from_disk() {
        let h = harness(
            ScriptedAgent::new(vec![Step {
                outcome: Err(AgentCallError::Unreachable("connection reset".to_string())),
                write_files: 120,
                file_size: 8,
            }]),
            &["docs"],
        );
        let run = h.executor.execute_job(&h.job).await.unwrap();

        assert_eq!(run.status, RunStatus::Partial);
        let result = &run.mappings[0];
        assert_eq!(result.status, MappingStatus::Partial);
        assert_eq!(result.stats.total_files, 120);
        assert_eq!(result.stats.bytes_processed, 120 * 8);
        assert!(result.warnings[0].contains("connection reset"));
    }

    #[tokio::test]
    async fn unreachable_agent_aborts_run_and_rolls_back() {
        let h = harness(
            ScriptedAgent::new(vec![
                Step {
                    outcome: Ok(ok_report(5, 500)),
                    write_files: 1,
                    file_size: 100,
                },
                step(Err(AgentCallError::Unreachable("refused".to_string()))),
            ]),
            &["docs", "pics"],
        );
        let err = h.executor.execute_job(&h.job).await.unwrap_err();
        assert!(matches!(err, ExecError::Mapping { .. }));

        // Both attempted copy targets were handed to the agent for deletion.
        let deleted = h.agent.deleted_paths();
        assert_eq!(deleted.len(), 2);
        assert!(deleted.iter().any(|p| p.contains("docs")));
        assert!(deleted.iter().any(|p| p.contains("pics")));

        let runs = h.executor.run_store().list_recent(10, None).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(!runs[0].retention_status.clone().unwrap().applied);
    }

    #[tokio::test]
    async fn stale_heartbeat_rejects_before_any_agent_call() {
        let h = harness(
            ScriptedAgent::new(vec![step(Ok(ok_report(1, 1)))]),
            &["docs"],
        );
        h.executor
            .heartbeat_store()
            .save(&Heartbeat {
                hostname: "client-01".to_string(),
                status: AgentStatus::Online,
                timestamp: Utc::now() - chrono::Duration::seconds(600),
                agent_ip: "10.0.0.12".to_string(),
                agent_port: 8750,
                backup_status: None,
                backup_job_id: None,
                backup_status_timestamp: None,
            })
            .unwrap();

        let err = h.executor.execute_job(&h.job).await.unwrap_err();
        match err {
            ExecError::Mapping { source, .. } => {
                assert_eq!(source.kind, MappingErrorKind::AgentUnreachable);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // The backup endpoint was never called.
        assert_eq!(h.agent.remaining_steps(), 1);
    }
}
