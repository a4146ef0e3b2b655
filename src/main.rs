//! Hearthlink - PIN and device authenticated household chat gateway
//!
//! Serves a WebSocket endpoint on the LAN. Each household member logs in with
//! a PIN, optionally bound to their devices' hardware addresses, and parents
//! and admins confirm with a passphrase.

use anyhow::{Context, Result};
use clap::Parser;
use hearthlink_audit::AuditLog;
use hearthlink_auth::{FileStore, IdentityDirectory};
use hearthlink_core::config::{DEFAULT_AGENT_TIMEOUT_SECS, DEFAULT_PORT, DEFAULT_RETENTION_MONTHS};
use hearthlink_core::Config;
use hearthlink_discovery::{ArpTable, NeighborTable};
use hearthlink_server::{create_router, AppState, ChatDelivery, CommandDelivery};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Hearthlink - household chat gateway
#[derive(Parser, Debug)]
#[command(name = "hearthlink")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short, long, env = "HEARTHLINK_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Server port
    #[arg(short, long, env = "HEARTHLINK_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// User directory file, YAML or JSON (default: ~/.config/hearthlink/users.yaml)
    #[arg(short, long, env = "HEARTHLINK_USERS")]
    users: Option<PathBuf>,

    /// Audit log directory (default: ~/.config/hearthlink/audit)
    #[arg(long, env = "HEARTHLINK_AUDIT_DIR")]
    audit_dir: Option<PathBuf>,

    /// Months of audit logs to keep
    #[arg(long, env = "HEARTHLINK_AUDIT_MONTHS", default_value_t = DEFAULT_RETENTION_MONTHS)]
    audit_months: u32,

    /// Command that answers chat messages (reads the message on stdin)
    #[arg(short, long, env = "HEARTHLINK_AGENT_COMMAND")]
    agent_command: Option<String>,

    /// Seconds to wait for the agent's reply before giving up
    #[arg(long, env = "HEARTHLINK_AGENT_TIMEOUT", default_value_t = DEFAULT_AGENT_TIMEOUT_SECS)]
    agent_timeout: u64,

    /// Path to TLS certificate file (PEM format)
    #[arg(long, env = "HEARTHLINK_TLS_CERT")]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, env = "HEARTHLINK_TLS_KEY")]
    key: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("Hearthlink v{}", env!("CARGO_PKG_VERSION"));

    let config = build_config(&args)?;

    info!("Loading users from {}", config.users_file.display());
    let store = Arc::new(FileStore::with_path(&config.users_file));
    let directory = IdentityDirectory::load(store)
        .with_context(|| format!("failed to load {}", config.users_file.display()))?;
    if directory.is_empty().await {
        warn!("No users configured; nobody can log in");
    } else {
        info!("{} user(s) configured", directory.len().await);
    }

    let audit = Arc::new(
        AuditLog::open(&config.audit_dir, config.audit_retention_months)
            .with_context(|| format!("failed to open audit log {}", config.audit_dir.display()))?,
    );
    audit.schedule_pruning();
    info!(
        "Audit log: {} ({} months retained)",
        config.audit_dir.display(),
        config.audit_retention_months
    );

    let arp = ArpTable::new();
    if !arp.is_available().await {
        error!("arp is not available; device checks are bypassed and logins are PIN only");
    }
    let neighbors: Arc<dyn NeighborTable> = Arc::new(arp);

    let delivery = config
        .agent_command
        .as_deref()
        .and_then(CommandDelivery::from_command_line)
        .map(|delivery| {
            info!("Chat delivery: {}", delivery.program());
            Arc::new(delivery) as Arc<dyn ChatDelivery>
        });
    if delivery.is_none() {
        warn!("No agent command configured; chat messages will be refused");
    }

    let state = Arc::new(
        AppState::new(config.clone(), Arc::new(directory), audit, neighbors)
            .with_delivery(delivery),
    );
    let router = create_router(state.clone());

    let addr: SocketAddr = config
        .listen_address()
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen_address()))?;
    let service = router.into_make_service_with_connect_info::<SocketAddr>();

    if let Some((cert, key)) = config.tls_files() {
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
            .await
            .context("failed to load TLS certificate")?;
        info!("Listening on wss://{}/ws", addr);
        info!("Press Ctrl+C to stop.");

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        let shutdown_state = state.clone();

        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
            shutdown_state.shutdown().await;
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });

        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(service)
            .await?;
    } else {
        info!("Listening on ws://{}/ws", addr);
        info!("Press Ctrl+C to stop.");

        let shutdown_state = state.clone();
        let shutdown = async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
            shutdown_state.shutdown().await;
        };

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, service)
            .with_graceful_shutdown(shutdown)
            .await?;
    }

    state.shutdown().await;
    info!("Hearthlink stopped");
    Ok(())
}

fn build_config(args: &Args) -> Result<Config> {
    let users_file = match &args.users {
        Some(path) => path.clone(),
        None => FileStore::default_path().context("no users file given")?,
    };
    let audit_dir = match &args.audit_dir {
        Some(path) => path.clone(),
        None => dirs::config_dir()
            .context("no audit directory given")?
            .join("hearthlink")
            .join("audit"),
    };

    Ok(Config::new()
        .with_bind_address(&args.bind)
        .with_port(args.port)
        .with_users_file(users_file)
        .with_audit_dir(audit_dir)
        .with_audit_retention_months(args.audit_months)
        .with_agent_command(args.agent_command.clone())
        .with_agent_timeout_secs(args.agent_timeout)
        .with_tls(args.cert.clone(), args.key.clone()))
}
