use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, LevelFilter};
use tokio::net::TcpListener;

use clawgate::agent::EchoAgentRunner;
use clawgate::config::GatewayConfig;
use clawgate::gateway::GatewayState;
use clawgate::http::create_router;
use clawgate::observability;
use clawgate::paths::StatePaths;
use clawgate::tenant::TenantRegistry;
use clawgate::terminal::spawner::HostPtySpawner;

fn main() -> ExitCode {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "Error: {err:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    cli.common.init_logging()?;
    let config = GatewayConfig::load(cli.common.config.as_ref())?;

    match cli.command {
        Command::Serve(cmd) => run_serve(config, cmd),
        Command::Tenants { command } => run_tenants(config, command, cli.common.json),
        Command::Config { command } => handle_config(&cli.common, config, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "clawgate",
    author,
    version,
    about = "Multi-tenant gateway for agent workspaces.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true, env = "CLAWGATE_CONFIG")]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
}

impl CommonOpts {
    fn effective_log_level(&self) -> LevelFilter {
        if self.trace {
            LevelFilter::Trace
        } else if self.debug {
            LevelFilter::Debug
        } else {
            match self.verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        if self.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("clawgate={level},tower_http={level}")));

        if self.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .ok();
        }

        // Bridge for log-crate users.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the gateway server
    Serve(ServeCommand),
    /// Manage tenants
    Tenants {
        #[command(subcommand)]
        command: TenantsCommand,
    },
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
    /// State directory override
    #[arg(long, value_name = "PATH")]
    state_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum TenantsCommand {
    /// Register a new tenant and print its token
    Create {
        /// Tenant id, ^[a-z0-9][a-z0-9_-]{0,31}$
        tenant_id: String,
        /// Human-readable display name
        #[arg(long)]
        display_name: Option<String>,
    },
    /// List registered tenants
    List,
    /// Show one tenant's record
    Info { tenant_id: String },
    /// Remove a tenant
    Remove {
        tenant_id: String,
        /// Also delete the tenant's state subtree
        #[arg(long)]
        delete_data: bool,
        /// Skip the data-deletion guard
        #[arg(long, short)]
        force: bool,
    },
    /// Rotate and print a fresh token
    Token { tenant_id: String },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Write a default configuration file
    Reset,
}

#[tokio::main]
async fn run_serve(mut config: GatewayConfig, cmd: ServeCommand) -> Result<()> {
    if let Some(host) = cmd.host {
        config.host = host;
    }
    if let Some(port) = cmd.port {
        config.port = port;
    }
    if let Some(state_dir) = cmd.state_dir {
        config.state_dir = state_dir;
    }
    std::fs::create_dir_all(&config.state_dir).context("creating state dir")?;

    let bind = format!("{}:{}", config.host, config.port);
    let state = GatewayState::new(
        config,
        Arc::new(HostPtySpawner),
        Arc::new(EchoAgentRunner),
        None,
    );

    state.schedulers.start_all(&state.registry);
    observability::spawn_collector(state.paths.clone(), state.metrics.clone());

    let router = create_router(state);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!("clawgate listening on {bind}");
    axum::serve(listener, router.into_make_service())
        .await
        .context("server error")?;
    Ok(())
}

/// One JSON value on stdout with --json, a short human line otherwise.
fn emit(json_mode: bool, value: serde_json::Value, human: String) -> Result<()> {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{human}");
    }
    Ok(())
}

#[tokio::main]
async fn run_tenants(config: GatewayConfig, command: TenantsCommand, json: bool) -> Result<()> {
    let registry = TenantRegistry::new(StatePaths::new(&config.state_dir));
    match command {
        TenantsCommand::Create {
            tenant_id,
            display_name,
        } => {
            let token = registry.create(&tenant_id, display_name).await?;
            emit(
                json,
                serde_json::json!({ "tenantId": tenant_id, "token": token }),
                format!("Created tenant '{tenant_id}'.\nToken (shown once): {token}"),
            )
        }
        TenantsCommand::List => {
            let tenants = registry.list();
            emit(
                json,
                serde_json::json!({ "tenants": tenants }),
                if tenants.is_empty() {
                    "No tenants registered.".to_string()
                } else {
                    tenants.join("\n")
                },
            )
        }
        TenantsCommand::Info { tenant_id } => {
            let entry = registry
                .get(&tenant_id)
                .with_context(|| format!("tenant '{tenant_id}' not found"))?;
            emit(
                json,
                serde_json::json!({
                    "tenantId": tenant_id,
                    "displayName": entry.display_name,
                    "disabled": entry.disabled,
                    "createdAt": entry.created_at,
                    "lastSeenAt": entry.last_seen_at,
                    "quotas": entry.quotas,
                }),
                format!(
                    "{tenant_id}: disabled={} created={} lastSeen={}",
                    entry.disabled,
                    entry.created_at,
                    entry
                        .last_seen_at
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "never".to_string()),
                ),
            )
        }
        TenantsCommand::Remove {
            tenant_id,
            delete_data,
            force,
        } => {
            if delete_data && !force {
                bail!(
                    "refusing to delete data for '{tenant_id}' without --force \
                     (re-run with --force to confirm)"
                );
            }
            registry.remove(&tenant_id, delete_data).await?;
            emit(
                json,
                serde_json::json!({ "removed": tenant_id, "deletedData": delete_data }),
                format!("Removed tenant '{tenant_id}'."),
            )
        }
        TenantsCommand::Token { tenant_id } => {
            let token = registry.rotate(&tenant_id).await?;
            emit(
                json,
                serde_json::json!({ "tenantId": tenant_id, "token": token }),
                format!("Rotated token for '{tenant_id}'.\nToken (shown once): {token}"),
            )
        }
    }
}

fn handle_config(
    common: &CommonOpts,
    config: GatewayConfig,
    command: ConfigCommand,
) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigCommand::Path => {
            match &common.config {
                Some(path) => println!("{}", path.display()),
                None => println!("(defaults; no config file set; pass --config or CLAWGATE_CONFIG)"),
            }
            Ok(())
        }
        ConfigCommand::Reset => {
            let path = common
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from("clawgate.toml"));
            let defaults = GatewayConfig::default();
            let body = format!(
                "host = \"{}\"\nport = {}\nstate_dir = \"{}\"\nscheduling_enabled = {}\nbackup_prefix = \"{}\"\n",
                defaults.host,
                defaults.port,
                defaults.state_dir.display(),
                defaults.scheduling_enabled,
                defaults.backup_prefix,
            );
            std::fs::write(&path, body)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote default config to {}", path.display());
            Ok(())
        }
    }
}
