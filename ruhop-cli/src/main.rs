//! Ruhop Guard CLI
//!
//! Inspect the physical route, generate and check configuration, and bring a
//! kill-switch protected tunnel up.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hop_firewall::{plan_rules, KillSwitchPolicy, SubLayer};
use hop_tun::RouteSelector;
use ruhop_guard::Config;

/// Ruhop Guard - leak-safe tunnel and kill-switch control
#[derive(Parser)]
#[command(name = "ruhop-guard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace); defaults to the
    /// configuration's `common.log_level`, then `info`
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the preferred physical IPv4 default route
    Route {
        /// Interface alias to ignore (usually the tunnel)
        #[arg(short, long)]
        exclude: Option<String>,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "ruhop-guard.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file and print the kill-switch rules it installs
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "ruhop-guard.toml")]
        config: PathBuf,
    },

    /// Bring the tunnel and kill-switch up until Ctrl+C (Windows only)
    Up {
        /// Path to configuration file
        #[arg(short, long, default_value = "ruhop-guard.toml")]
        config: PathBuf,
    },
}

impl Commands {
    fn config_path(&self) -> Option<&Path> {
        match self {
            Commands::Check { config } | Commands::Up { config } => Some(config.as_path()),
            Commands::Route { .. } | Commands::GenConfig { .. } => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&log_level(&cli));

    match cli.command {
        Commands::Route { exclude } => show_route(exclude.as_deref()),
        Commands::GenConfig { output } => generate_config(&output),
        Commands::Check { config } => check_config(&config),
        Commands::Up { config } => run_up(&config).await,
    }
}

fn log_level(cli: &Cli) -> String {
    // Load errors surface later with full context
    let configured = cli
        .command
        .config_path()
        .and_then(|path| Config::load(path).ok());
    match configured {
        Some(config) => config.common.log_level_or(cli.log_level.as_deref()).to_string(),
        None => cli.log_level.clone().unwrap_or_else(|| "info".to_string()),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn show_route(exclude: Option<&str>) -> Result<()> {
    let route = RouteSelector::new()
        .best_physical_route(exclude)
        .context("Failed to determine the physical default route")?;
    println!("{}", route);
    Ok(())
}

fn generate_config(output: &Path) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the tunnel address and kill-switch server before running.");

    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let tunnel = &config.tunnel;

    println!("Configuration {:?} is valid", path);
    println!(
        "Tunnel {}: {} netmask {}, MTU {}, {} route(s)",
        tunnel.name,
        tunnel.address,
        tunnel.netmask,
        tunnel.mtu,
        tunnel.routes.len()
    );

    let Some(ks) = config.active_killswitch() else {
        println!("Kill-switch: disabled");
        return Ok(());
    };

    let policy = KillSwitchPolicy::new(ks.server, ks.port, ks.lan_networks()?);
    policy.validate()?;
    println!("Kill-switch rules for server {}:{}:", ks.server, ks.port);
    for rule in plan_rules(&policy, &SubLayer::default()) {
        println!("  {}", rule);
    }
    if ks.allow_physical_gateway {
        println!("  (plus a permit for the physical gateway found at connect time)");
    }
    if ks.permit_tunnel_address {
        println!("  (plus a local-address permit for {})", tunnel.address);
    }

    Ok(())
}

#[cfg(windows)]
async fn run_up(path: &Path) -> Result<()> {
    use std::sync::Arc;
    use std::time::Duration;

    use hop_firewall::KillSwitch;
    use hop_tun::windows::{is_admin, WintunDriver};
    use hop_tun::SystemRunner;
    use ruhop_guard::{open_tunnel, Guard};
    use tracing::{debug, error, warn};

    if !is_admin() {
        warn!("Not running as Administrator; adapter and filter calls will likely fail");
    }

    let config = load_config(path)?;
    info!("Configuration loaded from {:?}", path);

    let driver = WintunDriver::load().context("Failed to load the WinTun driver")?;
    let adapter = open_tunnel(&driver, &config.tunnel, Arc::new(SystemRunner))
        .context("Failed to open the tunnel adapter")?;
    let killswitch = KillSwitch::open().context("Failed to open the filter engine")?;

    let mut guard = Guard::new(config, adapter, killswitch);
    guard.connect().context("Failed to connect")?;
    info!("Connected; press Ctrl+C to disconnect");

    let adapter = Arc::clone(guard.adapter());
    let reader = tokio::task::spawn_blocking(move || {
        adapter.run_reader(Duration::from_millis(250), |packet| {
            debug!("Packet from OS: {} bytes", packet.len());
        })
    });

    wait_for_shutdown().await?;
    info!("Shutting down...");

    if let Err(e) = guard.close() {
        error!("Teardown reported an error: {}", e);
    }
    match reader.await {
        Ok(Ok(count)) => info!("Reader stopped after {} packets", count),
        Ok(Err(e)) => error!("Reader failed: {}", e),
        Err(e) => error!("Reader task failed: {}", e),
    }

    let stats = guard.stats();
    info!(
        "Tunnel totals: rx {} packets / {} bytes, tx {} packets / {} bytes",
        stats.packets_rx, stats.bytes_rx, stats.packets_tx, stats.bytes_tx
    );
    Ok(())
}

#[cfg(not(windows))]
async fn run_up(_path: &Path) -> Result<()> {
    anyhow::bail!("`up` requires Windows (WinTun and the Windows Filtering Platform)")
}

#[cfg(windows)]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C");
    Ok(())
}
