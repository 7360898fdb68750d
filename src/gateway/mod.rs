//! The RPC gateway: shared state, authorization, dispatch, and the
//! WebSocket server loop.

pub mod authorize;
pub mod connections;
pub mod dispatch;
pub mod handlers;
pub mod protocol;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use crate::agent::AgentRunner;
use crate::backup::{BackupOrchestrator, FsObjectStore, ObjectStore};
use crate::config::GatewayConfig;
use crate::cron::SchedulerSupervisor;
use crate::observability::MetricsRing;
use crate::paths::StatePaths;
use crate::quota::{DiskUsageCache, UsageLedger};
use crate::tenant::TenantRegistry;
use crate::terminal::spawner::PtySpawner;
use crate::terminal::TerminalManager;

use connections::ConnectionRegistry;
use handlers::channels::ChannelRegistry;
use handlers::pairing::PairingRegistry;

/// Everything the dispatcher and the HTTP surfaces share. Cheap to clone.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub paths: StatePaths,
    pub registry: TenantRegistry,
    pub ledger: UsageLedger,
    pub disk_cache: DiskUsageCache,
    pub connections: ConnectionRegistry,
    pub terminals: TerminalManager,
    pub schedulers: Arc<SchedulerSupervisor>,
    pub backups: BackupOrchestrator,
    pub runner: Arc<dyn AgentRunner>,
    pub metrics: MetricsRing,
    pub channels: ChannelRegistry,
    pub pairing: PairingRegistry,
    pub started_at: Instant,
}

impl GatewayState {
    /// Wire the full component graph over one state directory.
    pub fn new(
        config: GatewayConfig,
        spawner: Arc<dyn PtySpawner>,
        runner: Arc<dyn AgentRunner>,
        object_store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        let paths = StatePaths::new(&config.state_dir);
        let registry = TenantRegistry::new(paths.clone());
        let ledger = UsageLedger::new(paths.clone());
        let disk_cache = DiskUsageCache::new(paths.clone());
        let connections = ConnectionRegistry::new();
        let terminals = TerminalManager::new(spawner, connections.clone(), paths.clone());
        let schedulers = Arc::new(SchedulerSupervisor::new(
            paths.clone(),
            runner.clone(),
            connections.clone(),
            config.scheduling_enabled,
        ));
        let object_store = object_store
            .unwrap_or_else(|| Arc::new(FsObjectStore::new(config.object_store_dir())));
        let backups = BackupOrchestrator::new(
            registry.clone(),
            object_store,
            config.backup_prefix.clone(),
        );
        Self {
            config: Arc::new(config),
            paths,
            registry,
            ledger,
            disk_cache,
            connections,
            terminals,
            schedulers,
            backups,
            runner,
            metrics: MetricsRing::new(),
            channels: ChannelRegistry::new(),
            pairing: PairingRegistry::new(),
            started_at: Instant::now(),
        }
    }

    /// Disable-or-delete teardown shared by the admin surfaces: evict the
    /// tenant's connections, kill its terminals, drop its scheduler.
    pub fn teardown_tenant(&self, tenant_id: &str) {
        self.connections.evict_tenant(tenant_id);
        self.terminals.close_all_tenant_terminals(tenant_id);
        self.schedulers.remove(tenant_id);
        self.disk_cache.invalidate(tenant_id);
    }
}
