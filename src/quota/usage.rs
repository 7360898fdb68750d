//! Usage snapshots and the per-tenant ledger.

use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::paths::StatePaths;

use super::disk::DiskUsage;

/// Request counters kept inside a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestCounters {
    pub lifetime: u64,
    pub last_minute: u32,
    pub last_hour: u32,
}

/// One tenant's usage for one billing period.
///
/// Invariant: `total_tokens` equals the sum of the four token counters; the
/// ledger maintains it on every addition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageSnapshot {
    /// Billing period label, `YYYY-MM` in UTC.
    pub period: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub total_tokens: u64,
    pub cost_cents: u64,
    pub disk: DiskUsage,
    /// Sessions currently open. Clamped at zero on decrement.
    pub active_sessions: u32,
    pub total_sessions: u64,
    pub message_count: u64,
    pub requests: RequestCounters,
    pub sandbox_cpu_seconds: u64,
    pub sandbox_peak_memory_bytes: u64,
}

impl UsageSnapshot {
    fn fresh(period: String) -> Self {
        Self {
            period,
            ..Self::default()
        }
    }
}

/// `YYYY-MM` label for the given instant.
pub fn current_period(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Per-tenant usage ledger over the state directory.
///
/// Cloning shares the lock shards.
#[derive(Clone)]
pub struct UsageLedger {
    paths: StatePaths,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl UsageLedger {
    pub fn new(paths: StatePaths) -> Self {
        Self {
            paths,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn state_paths(&self) -> &StatePaths {
        &self.paths
    }

    pub(super) fn tenant_lock(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_snapshot(&self, tenant_id: &str) -> Option<UsageSnapshot> {
        let path = self.paths.tenant_usage_current(tenant_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("usage snapshot unreadable for {tenant_id}: {err}");
                return None;
            }
        };
        serde_json::from_str(&raw).ok()
    }

    fn write_snapshot(&self, tenant_id: &str, snapshot: &UsageSnapshot) -> Result<()> {
        let path = self.paths.tenant_usage_current(tenant_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("creating usage dir")?;
        }
        let json = serde_json::to_string_pretty(snapshot).context("serializing usage snapshot")?;
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Load the current snapshot, rolling the period over if the stored one
    /// is stale: the old snapshot is archived under its own label and a fresh
    /// zeroed snapshot becomes current.
    pub async fn load_usage(&self, tenant_id: &str) -> Result<UsageSnapshot> {
        self.load_usage_at(tenant_id, Utc::now()).await
    }

    /// Same as [`load_usage`](Self::load_usage) with an explicit clock.
    pub async fn load_usage_at(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;
        self.load_usage_locked(tenant_id, now)
    }

    /// Caller must hold the tenant lock.
    fn load_usage_locked(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<UsageSnapshot> {
        let period = current_period(now);
        match self.read_snapshot(tenant_id) {
            Some(snapshot) if snapshot.period == period => Ok(snapshot),
            Some(old) => {
                let archive = self.paths.tenant_usage_archive(tenant_id, &old.period);
                if let Some(parent) = archive.parent() {
                    fs::create_dir_all(parent).context("creating usage dir")?;
                }
                let json = serde_json::to_string_pretty(&old)?;
                fs::write(&archive, json)
                    .with_context(|| format!("archiving usage period {}", old.period))?;
                let fresh = UsageSnapshot::fresh(period);
                self.write_snapshot(tenant_id, &fresh)?;
                Ok(fresh)
            }
            None => {
                let fresh = UsageSnapshot::fresh(period);
                self.write_snapshot(tenant_id, &fresh)?;
                Ok(fresh)
            }
        }
    }

    /// Apply a closure to the current snapshot under the tenant lock.
    async fn mutate<F>(&self, tenant_id: &str, apply: F) -> Result<UsageSnapshot>
    where
        F: FnOnce(&mut UsageSnapshot),
    {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;
        let mut snapshot = self.load_usage_locked(tenant_id, Utc::now())?;
        apply(&mut snapshot);
        snapshot.total_tokens = snapshot.input_tokens
            + snapshot.output_tokens
            + snapshot.cache_read_tokens
            + snapshot.cache_write_tokens;
        self.write_snapshot(tenant_id, &snapshot)?;
        Ok(snapshot)
    }

    /// Monotonic token/cost additions.
    pub async fn update_token_usage(
        &self,
        tenant_id: &str,
        input: u64,
        output: u64,
        cache_read: u64,
        cache_write: u64,
        cost_cents: u64,
    ) -> Result<UsageSnapshot> {
        self.mutate(tenant_id, |s| {
            s.input_tokens += input;
            s.output_tokens += output;
            s.cache_read_tokens += cache_read;
            s.cache_write_tokens += cache_write;
            s.cost_cents += cost_cents;
            s.message_count += 1;
        })
        .await
    }

    /// Session open/close accounting. `active_sessions` clamps at zero.
    pub async fn update_session_count(
        &self,
        tenant_id: &str,
        delta: i32,
    ) -> Result<UsageSnapshot> {
        self.mutate(tenant_id, |s| {
            if delta >= 0 {
                s.active_sessions += delta as u32;
                s.total_sessions += delta as u64;
            } else {
                s.active_sessions = s.active_sessions.saturating_sub((-delta) as u32);
            }
        })
        .await
    }

    /// Sandbox consumption accounting.
    pub async fn update_sandbox_usage(
        &self,
        tenant_id: &str,
        cpu_seconds: u64,
        peak_memory_bytes: u64,
    ) -> Result<UsageSnapshot> {
        self.mutate(tenant_id, |s| {
            s.sandbox_cpu_seconds += cpu_seconds;
            s.sandbox_peak_memory_bytes = s.sandbox_peak_memory_bytes.max(peak_memory_bytes);
        })
        .await
    }

    /// Record a serviced request in the snapshot counters.
    pub(super) async fn record_request(
        &self,
        tenant_id: &str,
        last_minute: u32,
        last_hour: u32,
    ) -> Result<()> {
        self.mutate(tenant_id, |s| {
            s.requests.lifetime += 1;
            s.requests.last_minute = last_minute;
            s.requests.last_hour = last_hour;
        })
        .await
        .map(|_| ())
    }

    /// Write a freshly computed disk decomposition into the snapshot.
    pub async fn record_disk_usage(&self, tenant_id: &str, disk: DiskUsage) -> Result<UsageSnapshot> {
        self.mutate(tenant_id, |s| s.disk = disk).await
    }

    /// Archived period labels, newest first, for `usage.history`.
    pub fn archived_periods(&self, tenant_id: &str) -> Vec<String> {
        let dir = self.paths.tenant_dir(tenant_id).join("usage");
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut periods: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| {
                let stem = name.strip_suffix(".json")?;
                // Period archives are exactly YYYY-MM.
                let (year, month) = stem.split_once('-')?;
                (year.len() == 4
                    && month.len() == 2
                    && year.chars().all(|c| c.is_ascii_digit())
                    && month.chars().all(|c| c.is_ascii_digit()))
                .then(|| stem.to_string())
            })
            .collect();
        periods.sort_unstable_by(|a, b| b.cmp(a));
        periods
    }

    /// Load one archived snapshot by period label.
    pub fn archived_snapshot(&self, tenant_id: &str, period: &str) -> Option<UsageSnapshot> {
        let path = self.paths.tenant_usage_archive(tenant_id, period);
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ledger() -> (TempDir, UsageLedger) {
        let temp = TempDir::new().unwrap();
        let ledger = UsageLedger::new(StatePaths::new(temp.path()));
        (temp, ledger)
    }

    #[tokio::test]
    async fn test_token_totals_invariant() {
        let (_temp, ledger) = ledger();
        let snap = ledger
            .update_token_usage("demo", 100, 50, 25, 5, 12)
            .await
            .unwrap();
        assert_eq!(snap.total_tokens, 180);
        assert_eq!(snap.cost_cents, 12);
        assert_eq!(snap.message_count, 1);
    }

    #[tokio::test]
    async fn test_active_sessions_clamp_at_zero() {
        let (_temp, ledger) = ledger();
        ledger.update_session_count("demo", 2).await.unwrap();
        let snap = ledger.update_session_count("demo", -5).await.unwrap();
        assert_eq!(snap.active_sessions, 0);
        assert_eq!(snap.total_sessions, 2);
    }

    #[tokio::test]
    async fn test_month_rollover_archives_old_snapshot() {
        let (temp, ledger) = ledger();
        let july = Utc.with_ymd_and_hms(2026, 7, 15, 12, 0, 0).unwrap();
        let august = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 1).unwrap();

        ledger.load_usage_at("demo", july).await.unwrap();
        let grown = ledger
            .update_token_usage("demo", 10, 10, 0, 0, 1)
            .await
            .unwrap();
        // The test clock and the wall clock share a period here; rewrite the
        // stored period to the fixed one so the rollover below is observable.
        assert!(grown.total_tokens > 0);
        let mut stored = ledger.read_snapshot("demo").unwrap();
        stored.period = current_period(july);
        ledger.write_snapshot("demo", &stored).unwrap();

        let rolled = ledger.load_usage_at("demo", august).await.unwrap();
        assert_eq!(rolled.period, "2026-08");
        assert_eq!(rolled.total_tokens, 0);

        let archived = temp.path().join("tenants/demo/usage/2026-07.json");
        assert!(archived.is_file());
        let old: UsageSnapshot =
            serde_json::from_str(&std::fs::read_to_string(archived).unwrap()).unwrap();
        assert_eq!(old.total_tokens, stored.total_tokens);
        assert_eq!(ledger.archived_periods("demo"), vec!["2026-07".to_string()]);
    }

    #[tokio::test]
    async fn test_sandbox_peak_memory_is_a_max() {
        let (_temp, ledger) = ledger();
        ledger.update_sandbox_usage("demo", 5, 1000).await.unwrap();
        let snap = ledger.update_sandbox_usage("demo", 5, 400).await.unwrap();
        assert_eq!(snap.sandbox_cpu_seconds, 10);
        assert_eq!(snap.sandbox_peak_memory_bytes, 1000);
    }
}
