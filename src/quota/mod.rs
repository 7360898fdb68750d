//! Per-tenant quota enforcement and usage accounting.
//!
//! Counters are kept per tenant per billing period (`YYYY-MM`, UTC) in small
//! JSON documents under the tenant's `usage/` directory. Rate limits are two
//! bounded sliding windows persisted next to them. Lock discipline: one write
//! lock per tenant, sharded, so unrelated tenants never serialize.

mod disk;
mod limits;
mod usage;

pub use disk::{percent_of, DiskUsage, DiskUsageCache, DISK_CACHE_TTL};
pub use limits::{DenyReason, QuotaDecision, RateDecision};
pub use usage::{current_period, RequestCounters, UsageLedger, UsageSnapshot};
