use crate::executor::types::Run;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// One JSON document per run under runs/. `save` overwrites the document,
/// which is what makes incremental mid-run persistence visible to readers.
#[derive(Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            dir: data_dir.join("runs"),
        }
    }

    pub fn save(&self, run: &Run) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.json", run.run_id));
        fs::write(&path, serde_json::to_string_pretty(run)?)
            .with_context(|| format!("failed to persist run {}", run.run_id))?;
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<Option<Run>> {
        let path = self.dir.join(format!("{run_id}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Most recent first, optionally filtered by job.
    pub fn list_recent(&self, limit: usize, job_id: Option<&str>) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        if !self.dir.exists() {
            return Ok(runs);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(entry.path())?;
            match serde_json::from_str::<Run>(&content) {
                Ok(run) => {
                    if job_id.map_or(true, |id| run.job_id == id) {
                        runs.push(run);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        "skipping unreadable run record {}: {}",
                        entry.path().display(),
                        err
                    );
                }
            }
        }
        runs.sort_by(|a, b| b.start.cmp(&a.start));
        runs.truncate(limit);
        Ok(runs)
    }
}
