//! Interactive PTY session manager.
//!
//! One process-wide registry of tenant-owned pseudo-terminals. Output fans
//! out to the originating connection only; idle sessions are reaped in the
//! background. Cross-tenant access is denied outright, including for
//! admin-scoped but tenant-authenticated callers; only a connection without a
//! tenant id and with admin scope may touch another tenant's PTY.

pub mod spawner;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::gateway::authorize::ConnectionAuth;
use crate::gateway::connections::ConnectionRegistry;
use crate::gateway::protocol::ErrorShape;
use crate::paths::StatePaths;

use spawner::{PtyProcess, PtySinks, PtySpawner, SpawnRequest, DEFAULT_SHELL};

/// Reap cycle period.
pub const REAP_INTERVAL_SECS: u64 = 60;

/// A session with no activity for this long is killed.
pub const IDLE_CUTOFF_SECS: i64 = 5 * 60;

const MIN_COLS: u16 = 10;
const MAX_COLS: u16 = 500;
const MIN_ROWS: u16 = 5;
const MAX_ROWS: u16 = 200;

/// Parameters accepted by `terminal.spawn`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpawnOptions {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub shell: Option<String>,
    pub env: Option<HashMap<String, String>>,
}

/// What `terminal.list` reports per session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    pub terminal_id: String,
    pub tenant_id: String,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

struct PtySessionRecord {
    terminal_id: String,
    tenant_id: String,
    conn_id: u64,
    created_at: DateTime<Utc>,
    last_activity_ms: Arc<AtomicI64>,
    process: Box<dyn PtyProcess>,
}

impl PtySessionRecord {
    fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity_ms.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }

    fn info(&self) -> TerminalInfo {
        TerminalInfo {
            terminal_id: self.terminal_id.clone(),
            tenant_id: self.tenant_id.clone(),
            pid: self.process.pid(),
            created_at: self.created_at,
            last_activity_at: self.last_activity(),
        }
    }
}

/// Process-wide PTY session registry.
#[derive(Clone)]
pub struct TerminalManager {
    sessions: Arc<DashMap<String, Arc<PtySessionRecord>>>,
    spawner: Arc<dyn PtySpawner>,
    connections: ConnectionRegistry,
    paths: StatePaths,
    reaper_started: Arc<AtomicBool>,
}

impl TerminalManager {
    pub fn new(
        spawner: Arc<dyn PtySpawner>,
        connections: ConnectionRegistry,
        paths: StatePaths,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            spawner,
            connections,
            paths,
            reaper_started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn a sandboxed PTY for the authenticated tenant. Output and exit
    /// events reach only the originating connection.
    pub fn spawn(
        &self,
        auth: &ConnectionAuth,
        conn_id: u64,
        opts: SpawnOptions,
    ) -> Result<TerminalInfo, ErrorShape> {
        let Some(tenant_id) = auth.tenant_id.clone() else {
            return Err(ErrorShape::unauthorized(
                "terminal.spawn requires a tenant context",
            ));
        };
        let cols = opts.cols.unwrap_or(120).clamp(MIN_COLS, MAX_COLS);
        let rows = opts.rows.unwrap_or(32).clamp(MIN_ROWS, MAX_ROWS);
        let shell = opts
            .shell
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());

        let terminal_id = Uuid::new_v4().to_string();
        let last_activity_ms = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));

        let sinks = {
            let connections = self.connections.clone();
            let sessions = self.sessions.clone();
            let terminal_id = terminal_id.clone();
            let exit_terminal_id = terminal_id.clone();
            let exit_connections = self.connections.clone();
            let activity = last_activity_ms.clone();
            let targets: std::collections::HashSet<u64> = [conn_id].into();
            let exit_targets = targets.clone();
            PtySinks {
                on_data: Box::new(move |data: &[u8]| {
                    activity.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                    connections.broadcast_to_conn_ids(
                        "terminal.output",
                        json!({
                            "terminalId": terminal_id,
                            "data": String::from_utf8_lossy(data),
                        }),
                        &targets,
                        true,
                    );
                }),
                on_exit: Box::new(move |exit_code| {
                    exit_connections.broadcast_to_conn_ids(
                        "terminal.exit",
                        json!({
                            "terminalId": exit_terminal_id,
                            "exitCode": exit_code,
                        }),
                        &exit_targets,
                        true,
                    );
                    sessions.remove(&exit_terminal_id);
                }),
            }
        };

        let request = SpawnRequest {
            tenant_id: tenant_id.clone(),
            cwd: self.paths.tenant_workspace(&tenant_id),
            shell,
            env: opts.env.unwrap_or_default(),
            cols,
            rows,
        };
        let process = self
            .spawner
            .spawn(request, sinks)
            .map_err(|err| ErrorShape::unavailable(format!("pty spawn failed: {err:#}")))?;

        let record = Arc::new(PtySessionRecord {
            terminal_id: terminal_id.clone(),
            tenant_id,
            conn_id,
            created_at: Utc::now(),
            last_activity_ms,
            process,
        });
        let info = record.info();
        self.sessions.insert(terminal_id, record);
        self.ensure_reaper();
        Ok(info)
    }

    fn get_record(&self, terminal_id: &str) -> Result<Arc<PtySessionRecord>, ErrorShape> {
        if terminal_id.is_empty() {
            return Err(ErrorShape::invalid_request("terminalId is required"));
        }
        self.sessions
            .get(terminal_id)
            .map(|r| r.clone())
            .ok_or_else(|| ErrorShape::not_found(format!("unknown terminal '{terminal_id}'")))
    }

    /// Owner-or-admin rule. A tenant-authenticated caller only ever reaches
    /// its own sessions; a non-tenant connection needs admin scope.
    fn check_access(record: &PtySessionRecord, auth: &ConnectionAuth) -> Result<(), ErrorShape> {
        match auth.tenant_id.as_deref() {
            Some(tenant) if tenant == record.tenant_id => Ok(()),
            Some(_) => Err(ErrorShape::unauthorized(
                "terminal belongs to another tenant",
            )),
            None if auth.is_admin() => Ok(()),
            None => Err(ErrorShape::unauthorized("admin scope required")),
        }
    }

    pub fn write(
        &self,
        auth: &ConnectionAuth,
        terminal_id: &str,
        data: &str,
    ) -> Result<(), ErrorShape> {
        let record = self.get_record(terminal_id)?;
        Self::check_access(&record, auth)?;
        record
            .process
            .write(data.as_bytes())
            .map_err(|err| ErrorShape::unavailable(format!("pty write failed: {err:#}")))?;
        record
            .last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        Ok(())
    }

    pub fn resize(
        &self,
        auth: &ConnectionAuth,
        terminal_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), ErrorShape> {
        let record = self.get_record(terminal_id)?;
        Self::check_access(&record, auth)?;
        let cols = cols.clamp(MIN_COLS, MAX_COLS);
        let rows = rows.clamp(MIN_ROWS, MAX_ROWS);
        record
            .process
            .resize(cols, rows)
            .map_err(|err| ErrorShape::unavailable(format!("pty resize failed: {err:#}")))
    }

    /// Kill and forget a session. The record is deleted even when the kill
    /// itself fails.
    pub fn close(&self, auth: &ConnectionAuth, terminal_id: &str) -> Result<(), ErrorShape> {
        let record = self.get_record(terminal_id)?;
        Self::check_access(&record, auth)?;
        if let Err(err) = record.process.kill() {
            warn!("terminal {terminal_id}: kill failed during close: {err:#}");
        }
        self.sessions.remove(terminal_id);
        Ok(())
    }

    /// Sessions visible to the caller: all of them for non-tenant admins,
    /// the tenant's own otherwise.
    pub fn list(&self, auth: &ConnectionAuth) -> Vec<TerminalInfo> {
        let all_visible = auth.tenant_id.is_none() && auth.is_admin();
        let mut infos: Vec<TerminalInfo> = self
            .sessions
            .iter()
            .filter(|entry| {
                if all_visible {
                    true
                } else {
                    match auth.tenant_id.as_deref() {
                        Some(tenant) => entry.tenant_id == tenant,
                        None => false,
                    }
                }
            })
            .map(|entry| entry.info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Terminate every PTY owned by the tenant; returns how many were closed.
    /// Invoked when a tenant is disabled or deleted.
    pub fn close_all_tenant_terminals(&self, tenant_id: &str) -> usize {
        let victims: Vec<Arc<PtySessionRecord>> = self
            .sessions
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .map(|entry| entry.clone())
            .collect();
        for record in &victims {
            if let Err(err) = record.process.kill() {
                warn!(
                    "terminal {}: kill failed during tenant close: {err:#}",
                    record.terminal_id
                );
            }
            self.sessions.remove(&record.terminal_id);
        }
        if !victims.is_empty() {
            info!(
                "closed {} terminal(s) for tenant {tenant_id}",
                victims.len()
            );
        }
        victims.len()
    }

    /// One reap pass with an explicit clock. Returns the reaped ids.
    pub fn reap_once(&self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff_ms = now.timestamp_millis() - IDLE_CUTOFF_SECS * 1000;
        let idle: Vec<Arc<PtySessionRecord>> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_activity_ms.load(Ordering::Relaxed) < cutoff_ms)
            .map(|entry| entry.clone())
            .collect();
        let mut reaped = Vec::with_capacity(idle.len());
        for record in idle {
            info!(
                "reaping idle terminal {} (tenant {})",
                record.terminal_id, record.tenant_id
            );
            if let Err(err) = record.process.kill() {
                warn!("terminal {}: kill failed during reap: {err:#}", record.terminal_id);
            }
            self.connections.broadcast_to_conn_ids(
                "terminal.exit",
                json!({
                    "terminalId": record.terminal_id,
                    "exitCode": Option::<i32>::None,
                    "reason": "idle",
                }),
                &[record.conn_id].into(),
                true,
            );
            self.sessions.remove(&record.terminal_id);
            reaped.push(record.terminal_id.clone());
        }
        reaped
    }

    /// Start the background reaper on first use; it runs until process exit.
    fn ensure_reaper(&self) {
        if self.reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(REAP_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.reap_once(Utc::now());
            }
        });
    }
}
