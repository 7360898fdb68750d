//! A single job scheduler, global or tenant-scoped.
//!
//! The scheduler ticks on a coarse interval and fires every enabled job whose
//! cron expression matched since the previous tick. Runs land on the agent
//! runner under a dedicated session-key namespace (`…:cron:{jobId}`), so
//! cron-initiated sessions can never collide with user sessions. Lifecycle
//! events go to the broadcast channel with drop-if-slow set; the run log is
//! append-only best effort.

use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::json;
use tokio::task::JoinHandle;

use crate::agent::AgentRunner;
use crate::gateway::connections::ConnectionRegistry;
use crate::paths::StatePaths;
use crate::settings;

use super::{JobStore, ScheduledJob};

/// Default tick period.
const TICK_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// `None` for the global scheduler.
    pub tenant_id: Option<String>,
    pub tick_secs: u64,
}

impl SchedulerConfig {
    pub fn global() -> Self {
        Self {
            tenant_id: None,
            tick_secs: TICK_SECS,
        }
    }

    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            tick_secs: TICK_SECS,
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: JobStore,
    paths: StatePaths,
    runner: Arc<dyn AgentRunner>,
    connections: ConnectionRegistry,
    running: AtomicBool,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
    last_tick: std::sync::Mutex<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        paths: StatePaths,
        runner: Arc<dyn AgentRunner>,
        connections: ConnectionRegistry,
    ) -> Self {
        let store = match &config.tenant_id {
            Some(tenant) => JobStore::new(paths.tenant_cron_jobs(tenant)),
            None => JobStore::new(paths.global_cron_jobs()),
        };
        Self {
            config,
            store,
            paths,
            runner,
            connections,
            running: AtomicBool::new(false),
            task: std::sync::Mutex::new(None),
            last_tick: std::sync::Mutex::new(Utc::now()),
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.config.tenant_id.as_deref()
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Event name for this scheduler's lifecycle broadcasts.
    pub fn event_name(&self) -> String {
        match self.tenant_id() {
            Some(tenant) => format!("tenant:{tenant}:cron"),
            None => "cron".to_string(),
        }
    }

    /// Session key a run of the given job executes under.
    pub fn session_key_for(&self, job_id: &str) -> String {
        match self.tenant_id() {
            Some(tenant) => format!("tenant:{tenant}:cron:{job_id}"),
            None => format!("cron:{job_id}"),
        }
    }

    /// Jobs with at least one fire time in `(since, now]`.
    pub fn due_jobs(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Vec<ScheduledJob> {
        self.store
            .load()
            .into_iter()
            .filter(|job| job.enabled)
            .filter(|job| match cron::Schedule::from_str(&job.schedule) {
                Ok(schedule) => schedule
                    .after(&since)
                    .take_while(|fire| *fire <= now)
                    .next()
                    .is_some(),
                Err(err) => {
                    warn!("job {} has unparseable schedule: {err}", job.id);
                    false
                }
            })
            .collect()
    }

    /// Fire one job immediately (schedule tick or explicit `cron.run`).
    pub async fn run_job(&self, job: &ScheduledJob) {
        let session_key = self.session_key_for(&job.id);
        let agent_id = self.resolve_agent_id(job);
        let event = self.event_name();
        let started_at = Utc::now();

        self.connections.broadcast(
            &event,
            json!({
                "jobId": job.id,
                "name": job.name,
                "phase": "start",
                "sessionKey": session_key,
            }),
            true,
        );

        let outcome = self.runner.run(&session_key, &agent_id, &job.payload).await;
        let finished_at = Utc::now();
        let (ok, error) = match &outcome {
            Ok(_) => (true, None),
            Err(err) => (false, Some(format!("{err:#}"))),
        };

        self.connections.broadcast(
            &event,
            json!({
                "jobId": job.id,
                "name": job.name,
                "phase": if ok { "finish" } else { "error" },
                "sessionKey": session_key,
                "error": error,
            }),
            true,
        );

        if let Err(err) = self.store.set_state(
            &job.id,
            json!({
                "lastRunAt": finished_at,
                "lastStatus": if ok { "ok" } else { "error" },
                "lastError": error,
            }),
        ) {
            warn!("job {}: failed to persist run state: {err:#}", job.id);
        }

        self.append_run_log(&job.id, &session_key, started_at, finished_at, ok, error);
    }

    /// Run a job by id regardless of its schedule. Returns false if missing.
    pub async fn run_job_by_id(&self, job_id: &str) -> bool {
        match self.store.get(job_id) {
            Some(job) => {
                self.run_job(&job).await;
                true
            }
            None => false,
        }
    }

    fn resolve_agent_id(&self, job: &ScheduledJob) -> String {
        if let Some(agent_id) = &job.agent_id {
            return agent_id.clone();
        }
        match self.tenant_id() {
            Some(tenant) => match settings::load_overlay(&self.paths, tenant) {
                Ok(overlay) => settings::resolve_default_agent(&overlay),
                Err(err) => {
                    warn!("tenant {tenant}: overlay unreadable, using default agent: {err:#}");
                    settings::DEFAULT_AGENT_ID.to_string()
                }
            },
            None => settings::DEFAULT_AGENT_ID.to_string(),
        }
    }

    /// Best-effort append; failures are logged and never fail the job.
    fn append_run_log(
        &self,
        job_id: &str,
        session_key: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        ok: bool,
        error: Option<String>,
    ) {
        let path = match self.tenant_id() {
            Some(tenant) => self.paths.tenant_cron_run_log(tenant, job_id),
            None => self.paths.global_cron_run_log(job_id),
        };
        let entry = json!({
            "jobId": job_id,
            "sessionKey": session_key,
            "startedAt": started_at,
            "finishedAt": finished_at,
            "ok": ok,
            "error": error,
        });
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(file, "{entry}")
        })();
        if let Err(err) = result {
            warn!("job {job_id}: run-log append failed: {err}");
        }
    }

    /// Read the run log back, newest last.
    pub fn run_log(&self, job_id: &str) -> Vec<serde_json::Value> {
        let path = match self.tenant_id() {
            Some(tenant) => self.paths.tenant_cron_run_log(tenant, job_id),
            None => self.paths.global_cron_run_log(job_id),
        };
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        raw.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// One tick with an explicit clock: fire everything due since last tick.
    pub async fn tick_at(&self, now: DateTime<Utc>) {
        let since = {
            let mut last = match self.last_tick.lock() {
                Ok(last) => last,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *last, now)
        };
        for job in self.due_jobs(since, now) {
            debug!("firing job {} ({})", job.id, job.name);
            self.run_job(&job).await;
        }
    }

    /// Start the background tick loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *match self.last_tick.lock() {
            Ok(last) => last,
            Err(poisoned) => poisoned.into_inner(),
        } = Utc::now();
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                scheduler.config.tick_secs,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !scheduler.is_running() {
                    break;
                }
                scheduler.tick_at(Utc::now()).await;
            }
        });
        let mut task = match self.task.lock() {
            Ok(task) => task,
            Err(poisoned) => poisoned.into_inner(),
        };
        *task = Some(handle);
        info!(
            "scheduler started ({})",
            self.tenant_id().unwrap_or("global")
        );
    }

    /// Stop the tick loop. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut task = match self.task.lock() {
            Ok(task) => task,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = task.take() {
            handle.abort();
        }
        info!(
            "scheduler stopped ({})",
            self.tenant_id().unwrap_or("global")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EchoAgentRunner;
    use crate::cron::JobSpec;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn scheduler(tenant: Option<&str>) -> (TempDir, Arc<Scheduler>) {
        let temp = TempDir::new().unwrap();
        let config = match tenant {
            Some(t) => SchedulerConfig::tenant(t),
            None => SchedulerConfig::global(),
        };
        let scheduler = Arc::new(Scheduler::new(
            config,
            StatePaths::new(temp.path()),
            Arc::new(EchoAgentRunner),
            ConnectionRegistry::new(),
        ));
        (temp, scheduler)
    }

    fn hourly(name: &str) -> JobSpec {
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
    fn test_session_key_namespaces() {
        let (_t, global) = scheduler(None);
        assert_eq!(global.session_key_for("j1"), "cron:j1");
        assert_eq!(global.event_name(), "cron");

        let (_t, tenant) = scheduler(Some("demo"));
        assert_eq!(tenant.session_key_for("j1"), "tenant:demo:cron:j1");
        assert_eq!(tenant.event_name(), "tenant:demo:cron");
    }

    #[test]
    fn test_due_jobs_window() {
        let (_t, s) = scheduler(Some("demo"));
        let job = s.store().add(hourly("on-the-hour")).unwrap();

        let before = Utc.with_ymd_and_hms(2026, 7, 1, 11, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 30).unwrap();
        let due = s.due_jobs(before, after);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, job.id);

        // No boundary inside the window, nothing fires.
        let mid1 = Utc.with_ymd_and_hms(2026, 7, 1, 12, 10, 0).unwrap();
        let mid2 = Utc.with_ymd_and_hms(2026, 7, 1, 12, 20, 0).unwrap();
        assert!(s.due_jobs(mid1, mid2).is_empty());

        // Disabled jobs never fire.
        s.store()
            .update(
                &job.id,
                crate::cron::JobUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(s.due_jobs(before, after).is_empty());
    }

    #[tokio::test]
    async fn test_run_job_appends_log_and_state() {
        let (_t, s) = scheduler(Some("demo"));
        let job = s.store().add(hourly("nightly")).unwrap();
        assert!(s.run_job_by_id(&job.id).await);

        let log = s.run_log(&job.id);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0]["ok"], true);
        assert_eq!(log[0]["sessionKey"], format!("tenant:demo:cron:{}", job.id));

        let stored = s.store().get(&job.id).unwrap();
        assert_eq!(stored.state["lastStatus"], "ok");

        assert!(!s.run_job_by_id("missing").await);
    }
}
