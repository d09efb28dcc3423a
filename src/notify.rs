use crate::executor::types::{Run, RunStatus};
use crate::jobs::types::Job;
use async_trait::async_trait;
use tracing::{info, warn};

/// Narrow seam towards the alerting/email side. `is_new_condition` is false
/// when the same condition was already active for the job on the previous
/// run, so collaborators can skip re-escalation.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn run_finished(&self, job: &Job, run: &Run, is_new_condition: bool);
}

/// Key identifying an alert condition; two runs failing the same way get
/// the same key.
pub fn condition_key(run: &Run) -> Option<String> {
    match run.status {
        RunStatus::Success | RunStatus::Running => None,
        status => {
            let first_error = run
                .mappings
                .iter()
                .flat_map(|m| m.errors.iter())
                .chain(run.errors.iter())
                .next()
                .map(String::as_str)
                .unwrap_or("");
            Some(format!("{}:{}", status.as_str(), first_error))
        }
    }
}

/// Default collaborator: just logs. The real alert/email wiring lives
/// outside the engine and implements the same trait.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn run_finished(&self, job: &Job, run: &Run, is_new_condition: bool) {
        match run.status {
            RunStatus::Success => {
                info!(
                    "job '{}' finished: success, {} bytes across {} mappings",
                    job.name,
                    run.bytes_processed,
                    run.mappings.len()
                );
            }
            status => {
                if is_new_condition {
                    warn!(
                        "job '{}' finished: {} ({} errors, {} warnings)",
                        job.name,
                        status.as_str(),
                        run.errors.len()
                            + run.mappings.iter().map(|m| m.errors.len()).sum::<usize>(),
                        run.warnings.len()
                            + run.mappings.iter().map(|m| m.warnings.len()).sum::<usize>(),
                    );
                } else {
                    info!(
                        "job '{}' still {}, condition unchanged since last run",
                        job.name,
                        status.as_str()
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::types::Run;
    use crate::jobs::types::{Job, MappingMode, Schedule};
    use chrono::Utc;

    fn run(status: RunStatus) -> Run {
        let job = Job {
            job_id: "job-1".to_string(),
            name: "docs".to_string(),
            client_hostname: "client-01".to_string(),
            enabled: true,
            mode_default: MappingMode::Copy,
            schedule: Schedule::Daily {
                days: None,
                times: vec!["02:00".to_string()],
            },
            mappings: Vec::new(),
        };
        let mut run = Run::new("run-1".to_string(), &job, Utc::now());
        run.status = status;
        run
    }

    #[test]
    fn success_clears_the_condition() {
        assert!(condition_key(&run(RunStatus::Success)).is_none());
    }

    #[test]
    fn identical_failures_share_a_key() {
        let mut a = run(RunStatus::Failed);
        a.errors.push("agent offline".to_string());
        let mut b = run(RunStatus::Failed);
        b.errors.push("agent offline".to_string());
        assert_eq!(condition_key(&a), condition_key(&b));

        let mut c = run(RunStatus::Partial);
        c.errors.push("agent offline".to_string());
        assert_ne!(condition_key(&a), condition_key(&c));
    }
}
