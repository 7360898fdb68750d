//! clawgate: multi-tenant gateway for agent workspaces.
//!
//! Terminates authenticated WebSocket RPC and a small HTTP compatibility
//! surface, dispatches method calls to internal subsystems, and enforces
//! strict tenant isolation over shared on-host resources: filesystem state,
//! scheduled jobs, sandboxed interactive terminals, quotas, and off-box
//! backup storage.

pub mod agent;
pub mod backup;
pub mod config;
pub mod cron;
pub mod gateway;
pub mod http;
pub mod observability;
pub mod paths;
pub mod quota;
pub mod session_key;
pub mod settings;
pub mod tenant;
pub mod terminal;
