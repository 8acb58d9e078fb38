//! SlsRelay - server-list override and game-session relay
//!
//! Points the game client's server-list hostname at a local endpoint, serves
//! the upstream list with custom servers rewritten to local relays, and relays
//! each game session through the preloaded interceptor modules.

use anyhow::{Context, Result};
use clap::Parser;
use std::fmt::Write as _;
use std::future::Future;
use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slsrelay::{
    config::{AppConfig, ConfigManager},
    diagnostics::PortConflictDiagnostics,
    lifecycle::select_region,
    modules::ModulePreloader,
    relay::RelaySettings,
    serverlist::{FileServerList, HttpServerList, ServerListSource},
    HostsOverride, LifecycleCoordinator, ShutdownCoordinator,
};

/// CLI arguments for SlsRelay
#[derive(Parser, Debug)]
#[command(name = "slsrelay")]
#[command(about = "Server-list override and game-session relay")]
#[command(version)]
#[command(long_about = "
SlsRelay - server-list override and game-session relay

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  SLSRELAY_REGION          - Region code (NA, EU, RU, KR, JP, TW)
  SLSRELAY_MODULES_DIR     - Interceptor modules directory
  SLSRELAY_HOSTS_FILE      - Hosts file to edit
  SLSRELAY_SHUTDOWN_GRACE  - Shutdown grace period (e.g., 5s)
  SLSRELAY_LOG_LEVEL       - Log level (trace, debug, info, warn, error)

Editing the hosts file requires administrator (root) privileges.
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Region code (overrides config file)
    #[arg(short, long)]
    pub region: Option<String>,

    /// Interceptor modules directory (overrides config file)
    #[arg(long)]
    pub modules_dir: Option<PathBuf>,

    /// Hosts file to edit (overrides config file)
    #[arg(long)]
    pub hosts_file: Option<PathBuf>,

    /// Serve a local JSON server list instead of fetching upstream
    #[arg(long)]
    pub server_list: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let code = run().await?;
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let args = CliArgs::parse();

    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.region.as_deref(),
        args.modules_dir.as_deref(),
        args.hosts_file.as_deref(),
        args.log_level.as_deref(),
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&config, args.verbose)?;

    info!("Starting SlsRelay v{}", env!("CARGO_PKG_VERSION"));

    let regions = ConfigManager::load_regions(&config.proxy.regions_file)?;
    let region = match select_region(&regions, &config.proxy.region) {
        Ok(region) => region,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(e.exit_code());
        }
    };

    if args.validate_config {
        print_summary(&config, &region);
        return Ok(0);
    }

    info!(
        "Region {}: overriding {} -> {}",
        region.code, region.hostname, region.listen_hostname
    );

    let hosts = HostsOverride::new(config.proxy.hosts_path());
    let preloader = ModulePreloader::new(&config.proxy.modules_dir);
    let settings = RelaySettings::from(&config.proxy);
    let shutdown = ShutdownCoordinator::new(config.proxy.shutdown_grace);

    let code = match args.server_list {
        Some(path) => {
            info!("Serving local server list from {}", path.display());
            let source = FileServerList::new(region.clone(), path);
            serve(
                LifecycleCoordinator::new(region, source, hosts, preloader, settings),
                &shutdown,
            )
            .await
        }
        None => {
            let source = HttpServerList::new(region.clone(), config.proxy.connect_timeout)?;
            serve(
                LifecycleCoordinator::new(region, source, hosts, preloader, settings),
                &shutdown,
            )
            .await
        }
    };

    Ok(code)
}

/// Start the coordinator, wait for a terminating signal, then shut down
async fn serve<S: ServerListSource>(
    mut coordinator: LifecycleCoordinator<S>,
    shutdown: &ShutdownCoordinator,
) -> i32 {
    let signals = wait_for_signal(shutdown);
    tokio::pin!(signals);

    let started = tokio::select! {
        result = coordinator.start() => Some(result),
        _ = &mut signals => None,
    };

    match started {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            error!("Startup failed: {}", e);
            return e.report(&PortConflictDiagnostics::new()).await;
        }
        None => {
            info!("Interrupted during startup");
            coordinator.terminate(shutdown).await;
            return 0;
        }
    }

    info!(
        "SlsRelay running with {} relay(s); press Ctrl+C to stop",
        coordinator.relays().map_or(0, |r| r.len())
    );

    signals.await;
    coordinator.terminate(shutdown).await;
    info!("Shutdown complete");
    0
}

/// Resolve on the first terminating signal; never resolves if handlers fail
fn wait_for_signal(shutdown: &ShutdownCoordinator) -> impl Future<Output = ()> + '_ {
    async move {
        if let Err(e) = shutdown.listen_for_signals().await {
            error!("Error setting up signal handlers: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

fn print_summary(config: &AppConfig, region: &slsrelay::RegionDescriptor) {
    print!("{}", summary(config, region));
}

/// Resolved configuration as printed by `--validate-config`
fn summary(config: &AppConfig, region: &slsrelay::RegionDescriptor) -> String {
    let mut out = String::from("✅ Configuration is valid\n");
    let _ = writeln!(out, "  Region: {}", region.code);
    let _ = writeln!(out, "  List source: {:?}", region.list_source());
    let _ = writeln!(out, "  Override: {} -> {}", region.hostname, region.listen_hostname);
    let _ = writeln!(out, "  List endpoint: {}", region.list_listen_addr());
    for (id, server) in &region.custom_servers {
        let _ = writeln!(out, "  Server {}: relay on {}", id, server.listen_addr());
    }
    let _ = writeln!(out, "  Modules directory: {}", config.proxy.modules_dir.display());
    let _ = writeln!(out, "  Hosts file: {}", config.proxy.hosts_path().display());
    let _ = writeln!(out, "  Shutdown grace: {:?}", config.proxy.shutdown_grace);
    out
}

/// Initialize tracing/logging
fn init_tracing(config: &AppConfig, verbose: bool) -> Result<()> {
    let log_level = if verbose {
        "debug"
    } else {
        &config.proxy.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_ignores_log_level() {
        let table = ConfigManager::parse_regions(
            r#"
            [regions.NA]
            url = "http://sls.service.enmasse.com:8080/servers/list.en"
            hostname = "sls.service.enmasse.com"
            port = 8080
            listen_hostname = "127.0.0.10"

            [regions.NA.custom_servers."4004"]
            port = 9250
            "#,
        )
        .unwrap();
        let region = select_region(&table, "NA").unwrap();

        let mut config = AppConfig::default();
        config.proxy.log_level = "error".into();

        let text = summary(&config, &region);
        assert!(text.starts_with("✅ Configuration is valid"));
        assert!(text.contains("  Region: NA\n"));
        assert!(text.contains("  List endpoint: 127.0.0.10:8080\n"));
        assert!(text.contains("  Server 4004: relay on 127.0.0.1:9250\n"));
    }
}
