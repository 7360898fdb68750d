//! Scheduled jobs: stores, per-tenant schedulers, and the supervisor.

mod scheduler;
mod supervisor;

pub use scheduler::{Scheduler, SchedulerConfig};
pub use supervisor::SchedulerSupervisor;

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    /// Standard cron expression, evaluated in UTC.
    pub schedule: String,
    /// Input handed to the agent runner on each fire.
    pub payload: String,
    /// Where results go (opaque to the scheduler core).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<Value>,
    /// Target agent; `None` resolves against the tenant's overlay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Opaque per-job state blob (last run outcome and the like).
    #[serde(default)]
    pub state: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when adding a job.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub name: String,
    pub schedule: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub delivery: Option<Value>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Selective job update.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub schedule: Option<String>,
    pub payload: Option<String>,
    pub delivery: Option<Value>,
    pub agent_id: Option<String>,
    pub enabled: Option<bool>,
}

/// Validate a cron expression by parsing it.
pub fn validate_schedule(expr: &str) -> Result<()> {
    cron::Schedule::from_str(expr)
        .map(|_| ())
        .with_context(|| format!("invalid cron expression '{expr}'"))
}

/// JSON-document job store; one per tenant plus one global.
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Vec<ScheduledJob> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(_) => return Vec::new(),
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.load().is_empty()
    }

    fn save(&self, jobs: &[ScheduledJob]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("creating cron dir")?;
        }
        let json = serde_json::to_string_pretty(jobs).context("serializing jobs")?;
        fs::write(&self.path, json)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    pub fn add(&self, spec: JobSpec) -> Result<ScheduledJob> {
        validate_schedule(&spec.schedule)?;
        if spec.name.is_empty() {
            bail!("job name is required");
        }
        let now = Utc::now();
        let job = ScheduledJob {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            enabled: spec.enabled,
            schedule: spec.schedule,
            payload: spec.payload,
            delivery: spec.delivery,
            agent_id: spec.agent_id,
            state: Value::Null,
            created_at: now,
            updated_at: now,
        };
        let mut jobs = self.load();
        jobs.push(job.clone());
        self.save(&jobs)?;
        Ok(job)
    }

    pub fn update(&self, job_id: &str, update: JobUpdate) -> Result<ScheduledJob> {
        if let Some(schedule) = &update.schedule {
            validate_schedule(schedule)?;
        }
        let mut jobs = self.load();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .with_context(|| format!("job '{job_id}' not found"))?;
        if let Some(name) = update.name {
            job.name = name;
        }
        if let Some(schedule) = update.schedule {
            job.schedule = schedule;
        }
        if let Some(payload) = update.payload {
            job.payload = payload;
        }
        if let Some(delivery) = update.delivery {
            job.delivery = Some(delivery);
        }
        if let Some(agent_id) = update.agent_id {
            job.agent_id = Some(agent_id);
        }
        if let Some(enabled) = update.enabled {
            job.enabled = enabled;
        }
        job.updated_at = Utc::now();
        let updated = job.clone();
        self.save(&jobs)?;
        Ok(updated)
    }

    pub fn remove(&self, job_id: &str) -> Result<()> {
        let mut jobs = self.load();
        let before = jobs.len();
        jobs.retain(|j| j.id != job_id);
        if jobs.len() == before {
            bail!("job '{job_id}' not found");
        }
        self.save(&jobs)
    }

    pub fn get(&self, job_id: &str) -> Option<ScheduledJob> {
        self.load().into_iter().find(|j| j.id == job_id)
    }

    /// Persist an updated opaque state blob for one job.
    pub fn set_state(&self, job_id: &str, state: Value) -> Result<()> {
        let mut jobs = self.load();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .with_context(|| format!("job '{job_id}' not found"))?;
        job.state = state;
        job.updated_at = Utc::now();
        self.save(&jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, JobStore) {
        let temp = TempDir::new().unwrap();
        let store = JobStore::new(temp.path().join("cron/jobs.json"));
        (temp, store)
    }

    fn spec(name: &str) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            schedule: "0 0 * * * *".to_string(),
            payload: "tick".to_string(),
            delivery: None,
            agent_id: None,
            enabled: true,
        }
    }

    #[test]
    fn test_add_update_remove_roundtrip() {
        let (_temp, store) = store();
        assert!(store.is_empty());
        let job = store.add(spec("nightly")).unwrap();
        assert!(!store.is_empty());

        let updated = store
            .update(
                &job.id,
                JobUpdate {
                    enabled: Some(false),
                    payload: Some("revised".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(store.get(&job.id).unwrap().payload, "revised");

        store.remove(&job.id).unwrap();
        assert!(store.get(&job.id).is_none());
        assert!(store.remove(&job.id).is_err());
    }

    #[test]
    fn test_invalid_schedule_rejected() {
        let (_temp, store) = store();
        let mut bad = spec("bad");
        bad.schedule = "not a schedule".to_string();
        assert!(store.add(bad).is_err());
    }

    #[test]
    fn test_state_blob_persists() {
        let (_temp, store) = store();
        let job = store.add(spec("nightly")).unwrap();
        store
            .set_state(&job.id, serde_json::json!({"lastStatus": "ok"}))
            .unwrap();
        assert_eq!(
            store.get(&job.id).unwrap().state["lastStatus"],
            "ok"
        );
    }
}
