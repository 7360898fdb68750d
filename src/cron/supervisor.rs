//! Scheduler fleet supervision: one global scheduler plus one per tenant.
//!
//! Lifecycle choice (documented in DESIGN.md): ensure on first add, never
//! stop on last remove. A tenant scheduler is constructed the first time it
//! is needed and keeps running until the tenant goes away or the gateway
//! shuts down.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use log::info;

use crate::agent::AgentRunner;
use crate::gateway::connections::ConnectionRegistry;
use crate::paths::StatePaths;
use crate::tenant::TenantRegistry;

use super::scheduler::{Scheduler, SchedulerConfig};

pub struct SchedulerSupervisor {
    global: Arc<Scheduler>,
    tenants: Mutex<HashMap<String, Arc<Scheduler>>>,
    paths: StatePaths,
    runner: Arc<dyn AgentRunner>,
    connections: ConnectionRegistry,
    /// When false, schedulers are created in the stopped state.
    scheduling_enabled: bool,
}

impl SchedulerSupervisor {
    pub fn new(
        paths: StatePaths,
        runner: Arc<dyn AgentRunner>,
        connections: ConnectionRegistry,
        scheduling_enabled: bool,
    ) -> Self {
        let global = Arc::new(Scheduler::new(
            SchedulerConfig::global(),
            paths.clone(),
            runner.clone(),
            connections.clone(),
        ));
        Self {
            global,
            tenants: Mutex::new(HashMap::new()),
            paths,
            runner,
            connections,
            scheduling_enabled,
        }
    }

    pub fn get_global(&self) -> Arc<Scheduler> {
        self.global.clone()
    }

    pub fn get_tenant(&self, tenant_id: &str) -> Option<Arc<Scheduler>> {
        let tenants = match self.tenants.lock() {
            Ok(tenants) => tenants,
            Err(poisoned) => poisoned.into_inner(),
        };
        tenants.get(tenant_id).cloned()
    }

    /// Construct the tenant's scheduler on first call; start it immediately
    /// when scheduling is enabled globally.
    pub fn ensure_tenant(&self, tenant_id: &str) -> Arc<Scheduler> {
        let mut tenants = match self.tenants.lock() {
            Ok(tenants) => tenants,
            Err(poisoned) => poisoned.into_inner(),
        };
        let scheduler = tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                Arc::new(Scheduler::new(
                    SchedulerConfig::tenant(tenant_id),
                    self.paths.clone(),
                    self.runner.clone(),
                    self.connections.clone(),
                ))
            })
            .clone();
        if self.scheduling_enabled {
            scheduler.start();
        }
        scheduler
    }

    /// Stop and drop a tenant's scheduler (tenant disabled or removed).
    pub fn remove(&self, tenant_id: &str) {
        let mut tenants = match self.tenants.lock() {
            Ok(tenants) => tenants,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(scheduler) = tenants.remove(tenant_id) {
            scheduler.stop();
            info!("dropped scheduler for tenant {tenant_id}");
        }
    }

    /// Start the global scheduler, then one per non-disabled tenant whose job
    /// store is non-empty.
    pub fn start_all(&self, registry: &TenantRegistry) {
        if !self.scheduling_enabled {
            info!("scheduling disabled; supervisor leaves schedulers stopped");
            return;
        }
        self.global.start();
        for tenant_id in registry.list() {
            let disabled = registry
                .get(&tenant_id)
                .map(|entry| entry.disabled)
                .unwrap_or(true);
            if disabled {
                continue;
            }
            let store = super::JobStore::new(self.paths.tenant_cron_jobs(&tenant_id));
            if store.is_empty() {
                continue;
            }
            self.ensure_tenant(&tenant_id);
        }
    }

    /// Stop every scheduler, global included. Instances stay registered so a
    /// later `start_all` can revive them.
    pub fn stop_all(&self) {
        self.global.stop();
        let tenants = match self.tenants.lock() {
            Ok(tenants) => tenants,
            Err(poisoned) => poisoned.into_inner(),
        };
        for scheduler in tenants.values() {
            scheduler.stop();
        }
    }

    /// Running-scheduler counts for the status surfaces.
    pub fn status(&self) -> (bool, usize) {
        let tenants = match self.tenants.lock() {
            Ok(tenants) => tenants,
            Err(poisoned) => poisoned.into_inner(),
        };
        let running = tenants.values().filter(|s| s.is_running()).count();
        (self.global.is_running(), running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EchoAgentRunner;
    use crate::cron::JobSpec;
    use tempfile::TempDir;

    fn supervisor(enabled: bool) -> (TempDir, TenantRegistry, SchedulerSupervisor) {
        let temp = TempDir::new().unwrap();
        let paths = StatePaths::new(temp.path());
        let registry = TenantRegistry::new(paths.clone());
        let supervisor = SchedulerSupervisor::new(
            paths,
            Arc::new(EchoAgentRunner),
            ConnectionRegistry::new(),
            enabled,
        );
        (temp, registry, supervisor)
    }

    #[tokio::test]
    async fn test_ensure_tenant_constructs_once() {
        let (_temp, _registry, supervisor) = supervisor(false);
        assert!(supervisor.get_tenant("demo").is_none());
        let first = supervisor.ensure_tenant("demo");
        let second = supervisor.ensure_tenant("demo");
        assert!(Arc::ptr_eq(&first, &second));
        // Scheduling disabled: created stopped.
        assert!(!first.is_running());
    }

    #[tokio::test]
    async fn test_ensure_starts_when_enabled() {
        let (_temp, _registry, supervisor) = supervisor(true);
        let scheduler = supervisor.ensure_tenant("demo");
        assert!(scheduler.is_running());
        supervisor.remove("demo");
        assert!(!scheduler.is_running());
        assert!(supervisor.get_tenant("demo").is_none());
    }

    #[tokio::test]
    async fn test_start_all_skips_disabled_and_empty_tenants() {
        let (_temp, registry, supervisor) = supervisor(true);
        registry.create("busy", None).await.unwrap();
        registry.create("idle", None).await.unwrap();
        registry.create("off", None).await.unwrap();
        registry
            .update(
                "off",
                crate::tenant::TenantUpdate {
                    disabled: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Give "busy" and "off" job stores; "idle" stays empty.
        for tenant in ["busy", "off"] {
            let store =
                super::super::JobStore::new(supervisor.paths.tenant_cron_jobs(tenant));
            store
                .add(JobSpec {
                    name: "nightly".to_string(),
                    schedule: "0 0 0 * * *".to_string(),
                    payload: String::new(),
                    delivery: None,
                    agent_id: None,
                    enabled: true,
                })
                .unwrap();
        }

        supervisor.start_all(&registry);
        let (global_running, tenant_running) = supervisor.status();
        assert!(global_running);
        assert_eq!(tenant_running, 1);
        assert!(supervisor.get_tenant("busy").is_some());
        assert!(supervisor.get_tenant("idle").is_none());
        assert!(supervisor.get_tenant("off").is_none());

        supervisor.stop_all();
        let (global_running, tenant_running) = supervisor.status();
        assert!(!global_running);
        assert_eq!(tenant_running, 0);
    }
}
