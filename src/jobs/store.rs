use super::types::Job;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize)]
struct JobStoreData {
    version: i32,
    jobs: Vec<Job>,
}

/// Narrow read contract over jobs.json. The CRUD layer owns writes; the
/// engine reloads the file whenever it needs the authoritative job set.
#[derive(Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            path: data_dir.join("jobs.json"),
        }
    }

    pub fn load_all(&self) -> Result<Vec<Job>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let data: JobStoreData = serde_json::from_str(&content)?;
        Ok(data.jobs)
    }

    pub fn load(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.load_all()?.into_iter().find(|j| j.job_id == job_id))
    }

    /// Test and bootstrap helper; production writes go through the CRUD
    /// layer with the same schema.
    pub fn save_all(&self, jobs: &[Job]) -> Result<()> {
        let data = JobStoreData {
            version: 1,
            jobs: jobs.to_vec(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&data)?)?;
        Ok(())
    }
}
