mod audit_file;
mod systemd;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::Result;
use mcp_hostd_core::{AuditSink, Config, NoServices, NullAuditSink, ServiceStateProvider};
use mcp_hostd_exec::CommandExecutor;
use mcp_hostd_plugin_system::SystemPlugin;
use mcp_hostd_server::HostdServer;
use mcp_hostd_snapshot::SnapshotStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::audit_file::JsonlAuditSink;
use crate::systemd::SystemdStates;

#[derive(Parser, Debug)]
#[command(name = "hostd", version, about = "Local control-plane MCP daemon")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon
    Serve(ServeArgs),
    /// List stored snapshots
    Snapshots,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Override the configured bind host
    #[arg(long)]
    host: Option<String>,
    /// Override the configured bind port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve(args) => serve(config, args, cli.log_level).await,
        Commands::Snapshots => list_snapshots(config).await,
    }
}

async fn serve(mut config: Config, args: ServeArgs, log_level: Option<String>) -> Result<()> {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    let _log_guard = init_tracing(&config, log_level.as_deref())?;
    if let Err(e) = trim_capabilities() {
        warn!(error = %e, "failed to trim capabilities");
    }

    let audit: Arc<dyn AuditSink> = Arc::new(JsonlAuditSink::new(&config.logging.log_dir)?);
    let executor = Arc::new(CommandExecutor::new(
        config.security.allowed_commands.clone(),
        Duration::from_millis(config.security.command_timeout),
    ));
    let service_executor = Arc::new(CommandExecutor::new(
        vec!["systemctl".to_string()],
        Duration::from_secs(30),
    ));
    let services: Arc<dyn ServiceStateProvider> = Arc::new(SystemdStates::new(
        service_executor,
        config.snapshots.services.clone(),
    ));
    let snapshots = Arc::new(SnapshotStore::new(
        config.snapshots.dir.clone(),
        Arc::clone(&services),
        Arc::clone(&audit),
    ));

    let mut builder = HostdServer::builder()
        .with_config(config.clone())
        .with_audit_sink(audit)
        .with_executor(Arc::clone(&executor));
    if config.plugin_enabled("system") {
        builder = builder.with_plugin(Arc::new(SystemPlugin::new(
            executor,
            snapshots,
            services,
            config.logging.log_dir.clone(),
        )));
    }
    let server = builder.build().await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl_c received; shutting down");
            signal_token.cancel();
        }
    });

    server.serve(shutdown).await?;
    Ok(())
}

async fn list_snapshots(config: Config) -> Result<()> {
    let store = SnapshotStore::new(
        config.snapshots.dir.clone(),
        Arc::new(NoServices),
        Arc::new(NullAuditSink),
    );
    for summary in store.list_snapshots().await? {
        println!(
            "{}  {}  files={} services={}  {}",
            summary.id,
            summary.created_at.to_rfc3339(),
            summary.file_count,
            summary.service_count,
            summary.description,
        );
    }
    Ok(())
}

fn init_tracing(config: &Config, override_level: Option<&str>) -> Result<WorkerGuard> {
    let level = override_level.unwrap_or_else(|| config.logging.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    std::fs::create_dir_all(&config.logging.log_dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("app")
        .filename_suffix("log")
        .max_log_files(config.logging.max_files as usize)
        .build(&config.logging.log_dir)?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Ok(guard)
}

/// When running as root, drop to the capability set the daemon actually
/// needs. A no-op for unprivileged runs.
fn trim_capabilities() -> Result<()> {
    use caps::{CapSet, Capability, CapsHashSet};

    if !nix::unistd::geteuid().is_root() {
        return Ok(());
    }
    let mut retained = CapsHashSet::new();
    for cap in [
        Capability::CAP_DAC_OVERRIDE,
        Capability::CAP_SYS_ADMIN,
        Capability::CAP_NET_ADMIN,
        Capability::CAP_SYS_CHROOT,
    ] {
        retained.insert(cap);
    }
    caps::set(None, CapSet::Effective, &retained)?;
    caps::set(None, CapSet::Permitted, &retained)?;
    info!("configured minimal capabilities");
    Ok(())
}
