//! Rate windows and the pre-request quota gate.

use std::fs;
use std::io::ErrorKind;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::tenant::TenantQuotas;

use super::usage::UsageLedger;

/// Machine-readable denial reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    QuotaExceeded,
    RateLimited,
    DiskFull,
    SessionsExceeded,
}

/// Outcome of the sliding-window rate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    pub retry_after_ms: Option<u64>,
}

impl RateDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_ms: None,
        }
    }

    fn limited(retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            reason: Some(DenyReason::RateLimited),
            retry_after_ms: Some(retry_after_ms),
        }
    }
}

/// Outcome of the full pre-request quota gate.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaDecision {
    Allowed {
        warning: Option<String>,
    },
    Denied {
        reason: DenyReason,
        message: String,
        retry_after_ms: Option<u64>,
    },
}

/// Persisted sliding windows of request timestamps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RateLimitState {
    minute: Vec<DateTime<Utc>>,
    hour: Vec<DateTime<Utc>>,
}

impl RateLimitState {
    /// Drop timestamps that have left their windows.
    fn clean(&mut self, now: DateTime<Utc>) {
        let minute_cutoff = now - Duration::seconds(60);
        let hour_cutoff = now - Duration::seconds(3600);
        self.minute.retain(|t| *t > minute_cutoff);
        self.hour.retain(|t| *t > hour_cutoff);
    }

    fn retry_after_ms(window: &[DateTime<Utc>], window_secs: i64, now: DateTime<Utc>) -> u64 {
        window
            .first()
            .map(|oldest| {
                let free_at = *oldest + Duration::seconds(window_secs);
                (free_at - now).num_milliseconds().max(0) as u64
            })
            .unwrap_or(0)
    }
}

impl UsageLedger {
    fn read_rate_state(&self, tenant_id: &str) -> RateLimitState {
        let path = self.state_paths().tenant_rate_limits(tenant_id);
        match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(err) if err.kind() == ErrorKind::NotFound => RateLimitState::default(),
            Err(_) => RateLimitState::default(),
        }
    }

    fn write_rate_state(&self, tenant_id: &str, state: &RateLimitState) -> Result<()> {
        let path = self.state_paths().tenant_rate_limits(tenant_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("creating usage dir")?;
        }
        let json = serde_json::to_string(state).context("serializing rate-limit state")?;
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Sliding-window admission check. On allow, the request is recorded in
    /// the windows and mirrored into the usage snapshot's request counters.
    pub async fn check_and_record_request(
        &self,
        tenant_id: &str,
        quotas: Option<&TenantQuotas>,
    ) -> Result<RateDecision> {
        self.check_and_record_request_at(tenant_id, quotas, Utc::now())
            .await
    }

    /// Same as [`check_and_record_request`](Self::check_and_record_request)
    /// with an explicit clock.
    pub async fn check_and_record_request_at(
        &self,
        tenant_id: &str,
        quotas: Option<&TenantQuotas>,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let lock = self.tenant_lock(tenant_id);
        let last_minute;
        let last_hour;
        {
            let _guard = lock.lock().await;
            let mut state = self.read_rate_state(tenant_id);
            state.clean(now);

            let rpm = quotas.and_then(|q| q.requests_per_minute);
            let rph = quotas.and_then(|q| q.requests_per_hour);

            if let Some(rpm) = rpm {
                if state.minute.len() as u32 >= rpm {
                    return Ok(RateDecision::limited(RateLimitState::retry_after_ms(
                        &state.minute,
                        60,
                        now,
                    )));
                }
            }
            if let Some(rph) = rph {
                if state.hour.len() as u32 >= rph {
                    return Ok(RateDecision::limited(RateLimitState::retry_after_ms(
                        &state.hour,
                        3600,
                        now,
                    )));
                }
            }

            state.minute.push(now);
            state.hour.push(now);
            last_minute = state.minute.len() as u32;
            last_hour = state.hour.len() as u32;
            self.write_rate_state(tenant_id, &state)?;
        }
        self.record_request(tenant_id, last_minute, last_hour)
            .await?;
        Ok(RateDecision::allowed())
    }

    /// Full pre-request gate: rate window first, then cumulative caps in
    /// priority order tokens → cost → disk → concurrent sessions. Crossing a
    /// soft limit attaches a human-readable warning to the Allowed result.
    pub async fn check_quota_before_request(
        &self,
        tenant_id: &str,
        quotas: Option<&TenantQuotas>,
    ) -> Result<QuotaDecision> {
        let rate = self.check_and_record_request(tenant_id, quotas).await?;
        if !rate.allowed {
            return Ok(QuotaDecision::Denied {
                reason: DenyReason::RateLimited,
                message: "request rate limit reached".to_string(),
                retry_after_ms: rate.retry_after_ms,
            });
        }

        let Some(quotas) = quotas else {
            return Ok(QuotaDecision::Allowed { warning: None });
        };
        let usage = self.load_usage(tenant_id).await?;
        let mut warning = None;

        if let Some(cap) = quotas.monthly_tokens {
            if usage.total_tokens >= cap {
                return Ok(QuotaDecision::Denied {
                    reason: DenyReason::QuotaExceeded,
                    message: format!(
                        "monthly token quota exhausted ({} of {cap})",
                        usage.total_tokens
                    ),
                    retry_after_ms: None,
                });
            }
        }
        if let Some(soft) = quotas.monthly_tokens_soft {
            if usage.total_tokens >= soft {
                warning = Some(format!(
                    "approaching monthly token quota: {} of soft limit {soft}",
                    usage.total_tokens
                ));
            }
        }

        if let Some(cap) = quotas.monthly_cost_cents {
            if usage.cost_cents >= cap {
                return Ok(QuotaDecision::Denied {
                    reason: DenyReason::QuotaExceeded,
                    message: format!(
                        "monthly cost quota exhausted ({}¢ of {cap}¢)",
                        usage.cost_cents
                    ),
                    retry_after_ms: None,
                });
            }
        }
        if warning.is_none() {
            if let Some(soft) = quotas.monthly_cost_cents_soft {
                if usage.cost_cents >= soft {
                    warning = Some(format!(
                        "approaching monthly cost quota: {}¢ of soft limit {soft}¢",
                        usage.cost_cents
                    ));
                }
            }
        }

        if let Some(cap) = quotas.disk_bytes {
            if usage.disk.total_bytes >= cap {
                return Ok(QuotaDecision::Denied {
                    reason: DenyReason::DiskFull,
                    message: format!(
                        "disk quota exhausted ({} of {cap} bytes)",
                        usage.disk.total_bytes
                    ),
                    retry_after_ms: None,
                });
            }
        }

        if let Some(cap) = quotas.concurrent_sessions {
            if usage.active_sessions >= cap {
                return Ok(QuotaDecision::Denied {
                    reason: DenyReason::SessionsExceeded,
                    message: format!("concurrent session cap reached ({cap})"),
                    retry_after_ms: None,
                });
            }
        }

        Ok(QuotaDecision::Allowed { warning })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::StatePaths;
    use tempfile::TempDir;

    fn ledger() -> (TempDir, UsageLedger) {
        let temp = TempDir::new().unwrap();
        let ledger = UsageLedger::new(StatePaths::new(temp.path()));
        (temp, ledger)
    }

    fn rpm_quota(rpm: u32) -> TenantQuotas {
        TenantQuotas {
            requests_per_minute: Some(rpm),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rate_window_denies_with_retry_hint() {
        let (_temp, ledger) = ledger();
        let quotas = rpm_quota(2);
        let now = Utc::now();
        for _ in 0..2 {
            let d = ledger
                .check_and_record_request_at("demo", Some(&quotas), now)
                .await
                .unwrap();
            assert!(d.allowed);
        }
        let denied = ledger
            .check_and_record_request_at("demo", Some(&quotas), now)
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(DenyReason::RateLimited));
        assert!(denied.retry_after_ms.unwrap() <= 60_000);
    }

    #[tokio::test]
    async fn test_window_cleaning_readmits() {
        let (_temp, ledger) = ledger();
        let quotas = rpm_quota(1);
        let earlier = Utc::now() - Duration::seconds(120);
        ledger
            .check_and_record_request_at("demo", Some(&quotas), earlier)
            .await
            .unwrap();
        // Two minutes later the window is empty again.
        let d = ledger
            .check_and_record_request_at("demo", Some(&quotas), Utc::now())
            .await
            .unwrap();
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn test_quota_priority_tokens_before_sessions() {
        let (_temp, ledger) = ledger();
        ledger
            .update_token_usage("demo", 1000, 0, 0, 0, 0)
            .await
            .unwrap();
        ledger.update_session_count("demo", 10).await.unwrap();
        let quotas = TenantQuotas {
            monthly_tokens: Some(500),
            concurrent_sessions: Some(1),
            ..Default::default()
        };
        match ledger
            .check_quota_before_request("demo", Some(&quotas))
            .await
            .unwrap()
        {
            QuotaDecision::Denied { reason, .. } => {
                assert_eq!(reason, DenyReason::QuotaExceeded)
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_soft_limit_warns_but_allows() {
        let (_temp, ledger) = ledger();
        ledger
            .update_token_usage("demo", 800, 0, 0, 0, 0)
            .await
            .unwrap();
        let quotas = TenantQuotas {
            monthly_tokens: Some(1000),
            monthly_tokens_soft: Some(500),
            ..Default::default()
        };
        match ledger
            .check_quota_before_request("demo", Some(&quotas))
            .await
            .unwrap()
        {
            QuotaDecision::Allowed { warning } => {
                assert!(warning.unwrap().contains("approaching monthly token quota"))
            }
            other => panic!("expected allow, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unlimited_tenant_is_always_allowed() {
        let (_temp, ledger) = ledger();
        let decision = ledger
            .check_quota_before_request("demo", None)
            .await
            .unwrap();
        assert_eq!(decision, QuotaDecision::Allowed { warning: None });
    }
}
