//! Host metrics sampling and the in-memory metrics ring.
//!
//! A single collector task samples CPU and memory from `/proc`, appends to a
//! bounded ring buffer (single writer, many readers), and persists the most
//! recent snapshot plus an hourly file under `metrics/` in the state dir.

use std::sync::Arc;
use std::sync::RwLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::paths::StatePaths;

/// Sampling period for the collector task.
pub const SAMPLE_INTERVAL_SECS: u64 = 30;

/// Ring capacity: two hours of 30-second samples.
const RING_CAPACITY: usize = 240;

#[derive(Debug, Clone, Copy)]
pub struct CpuTimes {
    total: u64,
    idle: u64,
}

#[derive(Debug, Clone, Copy)]
struct MemInfo {
    total_bytes: u64,
    available_bytes: u64,
}

/// One sampled system snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub mem_total_bytes: u64,
    pub mem_used_bytes: u64,
    pub mem_available_bytes: u64,
}

fn parse_cpu_times(contents: &str) -> Result<CpuTimes> {
    let line = contents
        .lines()
        .find(|line| line.starts_with("cpu "))
        .context("missing cpu line in /proc/stat")?;

    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|value| value.parse::<u64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parsing cpu times")?;
    if values.len() < 4 {
        anyhow::bail!("cpu stats line missing expected fields");
    }

    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total = values.iter().sum();
    Ok(CpuTimes { total, idle })
}

fn parse_meminfo(contents: &str) -> Result<MemInfo> {
    let mut total_kb = None;
    let mut available_kb = None;
    for line in contents.lines() {
        if line.starts_with("MemTotal:") {
            total_kb = parse_meminfo_kb(line);
        } else if line.starts_with("MemAvailable:") {
            available_kb = parse_meminfo_kb(line);
        }
    }
    Ok(MemInfo {
        total_bytes: total_kb.context("missing MemTotal in /proc/meminfo")? * 1024,
        available_bytes: available_kb.context("missing MemAvailable in /proc/meminfo")? * 1024,
    })
}

fn parse_meminfo_kb(line: &str) -> Option<u64> {
    line.split_whitespace().nth(1)?.parse::<u64>().ok()
}

fn compute_cpu_percent(prev: Option<&CpuTimes>, current: &CpuTimes) -> f64 {
    let Some(prev) = prev else {
        return 0.0;
    };
    let total_delta = current.total.saturating_sub(prev.total);
    if total_delta == 0 {
        return 0.0;
    }
    let idle_delta = current.idle.saturating_sub(prev.idle);
    let busy_delta = total_delta.saturating_sub(idle_delta);
    (busy_delta as f64 / total_delta as f64) * 100.0
}

/// Read one snapshot off the host.
pub async fn sample_host(prev_cpu: Option<CpuTimes>) -> Result<(SystemSnapshot, CpuTimes)> {
    let stat_contents = fs::read_to_string("/proc/stat")
        .await
        .context("reading /proc/stat")?;
    let mem_contents = fs::read_to_string("/proc/meminfo")
        .await
        .context("reading /proc/meminfo")?;

    let current_cpu = parse_cpu_times(&stat_contents)?;
    let mem = parse_meminfo(&mem_contents)?;
    Ok((
        SystemSnapshot {
            sampled_at: Utc::now(),
            cpu_percent: compute_cpu_percent(prev_cpu.as_ref(), &current_cpu),
            mem_total_bytes: mem.total_bytes,
            mem_used_bytes: mem.total_bytes.saturating_sub(mem.available_bytes),
            mem_available_bytes: mem.available_bytes,
        },
        current_cpu,
    ))
}

/// Bounded snapshot ring. The collector is the only writer.
#[derive(Clone, Default)]
pub struct MetricsRing {
    inner: Arc<RwLock<Vec<SystemSnapshot>>>,
}

impl MetricsRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, snapshot: SystemSnapshot) {
        let mut ring = match self.inner.write() {
            Ok(ring) => ring,
            Err(poisoned) => poisoned.into_inner(),
        };
        ring.push(snapshot);
        if ring.len() > RING_CAPACITY {
            let excess = ring.len() - RING_CAPACITY;
            ring.drain(..excess);
        }
    }

    pub fn latest(&self) -> Option<SystemSnapshot> {
        let ring = match self.inner.read() {
            Ok(ring) => ring,
            Err(poisoned) => poisoned.into_inner(),
        };
        ring.last().cloned()
    }

    pub fn len(&self) -> usize {
        let ring = match self.inner.read() {
            Ok(ring) => ring,
            Err(poisoned) => poisoned.into_inner(),
        };
        ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Persist a snapshot as the current one and under its hourly label.
pub async fn persist_snapshot(paths: &StatePaths, snapshot: &SystemSnapshot) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot).context("serializing snapshot")?;
    let current = paths.metrics_current();
    if let Some(parent) = current.parent() {
        fs::create_dir_all(parent).await.context("creating metrics dir")?;
    }
    fs::write(&current, &json).await.context("writing current snapshot")?;

    let hourly = paths.metrics_hourly(&snapshot.sampled_at.format("%Y-%m-%dT%H").to_string());
    if let Some(parent) = hourly.parent() {
        fs::create_dir_all(parent).await.context("creating hourly dir")?;
    }
    fs::write(&hourly, &json).await.context("writing hourly snapshot")?;
    Ok(())
}

/// Spawn the collector loop. Runs until process exit.
pub fn spawn_collector(paths: StatePaths, ring: MetricsRing) {
    tokio::spawn(async move {
        let mut prev_cpu: Option<CpuTimes> = None;
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(SAMPLE_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sample_host(prev_cpu).await {
                Ok((snapshot, cpu)) => {
                    prev_cpu = Some(cpu);
                    if let Err(err) = persist_snapshot(&paths, &snapshot).await {
                        warn!("failed to persist metrics snapshot: {err:#}");
                    }
                    ring.push(snapshot);
                }
                Err(err) => {
                    warn!("host metrics sample failed: {err:#}");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_times() {
        let sample = "cpu  2255 34 2290 22625563 6290 127 456 0 0 0\ncpu0 1 2 3 4\n";
        let parsed = parse_cpu_times(sample).unwrap();
        assert!(parsed.total > 0);
        assert_eq!(parsed.idle, 22625563 + 6290);
    }

    #[test]
    fn test_parse_meminfo() {
        let sample = "MemTotal:       16384256 kB\nMemFree:         123456 kB\nMemAvailable:    999999 kB\n";
        let info = parse_meminfo(sample).unwrap();
        assert_eq!(info.total_bytes, 16384256 * 1024);
        assert_eq!(info.available_bytes, 999999 * 1024);
    }

    #[test]
    fn test_compute_cpu_percent() {
        let prev = CpuTimes {
            total: 100,
            idle: 40,
        };
        let current = CpuTimes {
            total: 200,
            idle: 60,
        };
        let percent = compute_cpu_percent(Some(&prev), &current);
        assert!((percent - 80.0).abs() < 0.01);
        assert_eq!(compute_cpu_percent(None, &current), 0.0);
    }

    #[test]
    fn test_ring_is_bounded() {
        let ring = MetricsRing::new();
        for i in 0..(RING_CAPACITY + 10) {
            ring.push(SystemSnapshot {
                sampled_at: Utc::now(),
                cpu_percent: i as f64,
                mem_total_bytes: 0,
                mem_used_bytes: 0,
                mem_available_bytes: 0,
            });
        }
        assert_eq!(ring.len(), RING_CAPACITY);
        let latest = ring.latest().unwrap();
        assert_eq!(latest.cpu_percent, (RING_CAPACITY + 9) as f64);
    }

    #[tokio::test]
    async fn test_persist_snapshot_layout() {
        let temp = tempfile::TempDir::new().unwrap();
        let paths = StatePaths::new(temp.path());
        let snapshot = SystemSnapshot {
            sampled_at: Utc::now(),
            cpu_percent: 1.0,
            mem_total_bytes: 2,
            mem_used_bytes: 1,
            mem_available_bytes: 1,
        };
        persist_snapshot(&paths, &snapshot).await.unwrap();
        assert!(paths.metrics_current().is_file());
        let hour = snapshot.sampled_at.format("%Y-%m-%dT%H").to_string();
        assert!(paths.metrics_hourly(&hour).is_file());
    }
}
