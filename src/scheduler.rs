use crate::error::{ExecError, ExecResult};
use crate::executor::types::Run;
use crate::executor::JobExecutor;
use crate::jobs::schedule::next_run;
use crate::jobs::store::JobStore;
use crate::jobs::types::Job;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{self, Duration};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
struct ScheduledEntry {
    job: Job,
    next_run: DateTime<Utc>,
}

pub struct SchedulerStatus {
    pub jobs: usize,
    pub scheduled_jobs: usize,
    pub next_wake: Option<DateTime<Utc>>,
}

struct SchedulerInner {
    jobs: JobStore,
    executor: JobExecutor,
    entries: Mutex<Vec<ScheduledEntry>>,
    /// Bumped on every reload; a sleep that resolves against an older
    /// generation recomputes instead of firing.
    generation: AtomicU64,
    notify: Notify,
    idle_sleep: Duration,
    min_check_interval: Duration,
    anticipation_secs: i64,
}

/// Holds the next fire time per enabled job and sleeps on a single
/// self-rescheduling timer until the nearest one is due.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        jobs: JobStore,
        executor: JobExecutor,
        idle_sleep_secs: u64,
        min_check_interval_secs: u64,
        anticipation_secs: i64,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                jobs,
                executor,
                entries: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                notify: Notify::new(),
                idle_sleep: Duration::from_secs(idle_sleep_secs),
                min_check_interval: Duration::from_secs(min_check_interval_secs),
                anticipation_secs,
            }),
        }
    }

    pub async fn start(&self) {
        if let Err(err) = self.reload().await {
            error!("initial job load failed: {}", err);
        }
        {
            let entries = self.inner.entries.lock().await;
            info!("scheduler started with {} scheduled job(s)", entries.len());
        }

        let loop_scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let generation = loop_scheduler.inner.generation.load(Ordering::SeqCst);
                let sleep_for = loop_scheduler.sleep_target().await;

                tokio::select! {
                    _ = loop_scheduler.inner.notify.notified() => {
                        // Entry set was replaced; recompute the sleep target.
                    }
                    _ = time::sleep(sleep_for) => {
                        if loop_scheduler.inner.generation.load(Ordering::SeqCst) != generation {
                            // This sleep was armed against a superseded job
                            // set; do not fire from it.
                            continue;
                        }
                        loop_scheduler.fire_due().await;
                    }
                }
            }
        });
    }

    /// Atomically replace the scheduled-entry set from the job store. No
    /// window exists where a stale timer can fire against old entries: the
    /// set swaps under the lock and the generation bump invalidates any
    /// in-flight sleep.
    pub async fn reload(&self) -> anyhow::Result<()> {
        let jobs = self.inner.jobs.load_all()?;
        let now = Utc::now();
        let mut fresh = Vec::new();
        for job in jobs.into_iter().filter(|j| j.enabled) {
            match next_run(&job.schedule, now) {
                Some(at) => fresh.push(ScheduledEntry { job, next_run: at }),
                None => warn!(
                    "job '{}' has no computable next run and will not be scheduled",
                    job.name
                ),
            }
        }

        let mut entries = self.inner.entries.lock().await;
        *entries = fresh;
        drop(entries);

        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Run a job outside the timer. Shares the executor's single-flight
    /// guard with scheduled runs.
    pub async fn run_job_now(&self, job_id: &str) -> ExecResult<Run> {
        let job = self
            .inner
            .jobs
            .load(job_id)?
            .ok_or_else(|| ExecError::JobNotFound(job_id.to_string()))?;
        self.inner.executor.execute_job(&job).await
    }

    pub async fn status(&self) -> anyhow::Result<SchedulerStatus> {
        let jobs = self.inner.jobs.load_all()?;
        let entries = self.inner.entries.lock().await;
        Ok(SchedulerStatus {
            jobs: jobs.len(),
            scheduled_jobs: entries.len(),
            next_wake: entries.iter().map(|e| e.next_run).min(),
        })
    }

    #[cfg(test)]
    async fn next_runs(&self) -> Vec<(String, DateTime<Utc>)> {
        self.inner
            .entries
            .lock()
            .await
            .iter()
            .map(|e| (e.job.job_id.clone(), e.next_run))
            .collect()
    }

    /// Adaptive sleep: until 5 s before the nearest run, never below the
    /// minimum check interval, and a long idle nap when nothing is due.
    async fn sleep_target(&self) -> Duration {
        let entries = self.inner.entries.lock().await;
        let Some(nearest) = entries.iter().map(|e| e.next_run).min() else {
            return self.inner.idle_sleep;
        };
        let now = Utc::now();
        let until = (nearest - now)
            .num_seconds()
            .saturating_sub(self.inner.anticipation_secs);
        let until = Duration::from_secs(until.max(0) as u64);
        until.max(self.inner.min_check_interval)
    }

    /// Fire every entry that is due (clock pauses can make that several),
    /// then recompute each fired entry's next occurrence.
    async fn fire_due(&self) {
        let now = Utc::now();
        let mut entries = self.inner.entries.lock().await;
        let mut still_scheduled = Vec::new();
        for entry in entries.drain(..) {
            if entry.next_run > now {
                still_scheduled.push(entry);
                continue;
            }

            info!("job '{}' is due, firing", entry.job.name);
            let executor = self.inner.executor.clone();
            let job = entry.job.clone();
            tokio::spawn(async move {
                if let Err(err) = executor.execute_job(&job).await {
                    error!("scheduled run of job '{}' failed: {}", job.name, err);
                }
            });

            match next_run(&entry.job.schedule, now) {
                Some(at) => still_scheduled.push(ScheduledEntry {
                    job: entry.job,
                    next_run: at,
                }),
                // Once-schedules (and anything else with no future
                // occurrence) drop out until the next reload.
                None => info!("job '{}' has no further scheduled runs", entry.job.name),
            }
        }
        *entries = still_scheduled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::HttpAgentClient;
    use crate::config::AppConfig;
    use crate::jobs::types::{Mapping, MappingMode, Schedule};
    use crate::notify::LogNotifier;

    fn job(job_id: &str, schedule: Schedule, enabled: bool) -> Job {
        Job {
            job_id: job_id.to_string(),
            name: job_id.to_string(),
            client_hostname: "client-01".to_string(),
            enabled,
            mode_default: MappingMode::Copy,
            schedule,
            mappings: vec![Mapping {
                label: "docs".to_string(),
                source_path: "\\\\client-01\\share\\docs".to_string(),
                destination_path: "/srv/backups/docs".to_string(),
                mode: MappingMode::Copy,
                retention: None,
                credentials: None,
            }],
        }
    }

    fn scheduler_with_jobs(jobs: &[Job]) -> (tempfile::TempDir, Scheduler) {
        let data = tempfile::tempdir().unwrap();
        let cfg = AppConfig {
            data_dir: data.path().to_path_buf(),
            ..Default::default()
        };
        let store = JobStore::new(data.path().to_path_buf());
        store.save_all(jobs).unwrap();
        let executor = JobExecutor::new(
            cfg,
            Arc::new(HttpAgentClient::new(10, 15)),
            Arc::new(LogNotifier),
        );
        let scheduler = Scheduler::new(store, executor, 300, 10, 5);
        (data, scheduler)
    }

    #[tokio::test]
    async fn reload_is_idempotent_for_an_unchanged_job_set() {
        let daily = Schedule::Daily {
            days: None,
            times: vec!["02:00".to_string()],
        };
        let weekly = Schedule::Weekly {
            days_of_week: vec![6],
            every_n_weeks: 1,
            start_time: "03:30".to_string(),
        };
        let (_data, scheduler) =
            scheduler_with_jobs(&[job("a", daily, true), job("b", weekly, true)]);

        scheduler.reload().await.unwrap();
        let first = scheduler.next_runs().await;
        scheduler.reload().await.unwrap();
        let second = scheduler.next_runs().await;
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn disabled_and_unschedulable_jobs_are_left_out() {
        let daily = Schedule::Daily {
            days: None,
            times: vec!["02:00".to_string()],
        };
        let dead = Schedule::Daily {
            days: Some(vec![]),
            times: vec!["02:00".to_string()],
        };
        let (_data, scheduler) = scheduler_with_jobs(&[
            job("live", daily.clone(), true),
            job("disabled", daily, false),
            job("dead", dead, true),
        ]);

        scheduler.reload().await.unwrap();
        let entries = scheduler.next_runs().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "live");

        let status = scheduler.status().await.unwrap();
        assert_eq!(status.jobs, 3);
        assert_eq!(status.scheduled_jobs, 1);
        assert!(status.next_wake.is_some());
    }

    #[tokio::test]
    async fn run_job_now_reports_missing_jobs() {
        let (_data, scheduler) = scheduler_with_jobs(&[]);
        scheduler.reload().await.unwrap();
        let err = scheduler.run_job_now("ghost").await.unwrap_err();
        assert!(matches!(err, ExecError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn generation_bump_invalidates_stale_sleeps() {
        let daily = Schedule::Daily {
            days: None,
            times: vec!["02:00".to_string()],
        };
        let (_data, scheduler) = scheduler_with_jobs(&[job("a", daily, true)]);
        scheduler.reload().await.unwrap();
        let before = scheduler.inner.generation.load(Ordering::SeqCst);
        scheduler.reload().await.unwrap();
        assert_eq!(
            scheduler.inner.generation.load(Ordering::SeqCst),
            before + 1
        );
    }
}
