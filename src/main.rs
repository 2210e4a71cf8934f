//! LocalUp port manager - frp server-plugin for stable TCP/UDP remote ports
//!
//! Assigns every TCP/UDP proxy a public port from a fixed window and keeps the
//! assignment across restarts in a plain text port map.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use localup_port_allocator::{FilePortStore, PortAllocator, PortRange, DEFAULT_MAP_FILE};
use localup_port_plugin::{PluginServer, PluginServerConfig};

/// LocalUp port manager - assigns remote ports to frp TCP/UDP proxies
#[derive(Parser, Debug)]
#[command(name = "localup-portmanager")]
#[command(about = "frp server-plugin that assigns stable remote ports to TCP/UDP proxies")]
#[command(version)]
struct Cli {
    /// Port the plugin webhook listens on
    #[arg(long, env = "PLUGIN_PORT", default_value = "9001")]
    port: u16,

    /// Address the plugin webhook binds to
    #[arg(long, env = "PLUGIN_BIND_HOST", default_value = "0.0.0.0")]
    bind_host: IpAddr,

    /// Lowest remote port handed out (inclusive)
    #[arg(long, env = "PLUGIN_PORT_MIN", default_value = "30000")]
    port_min: u16,

    /// Highest remote port handed out (inclusive)
    #[arg(long, env = "PLUGIN_PORT_MAX", default_value = "30900")]
    port_max: u16,

    /// File holding the persisted client -> port map
    #[arg(long, env = "PLUGIN_PORT_MAP", default_value = DEFAULT_MAP_FILE)]
    map_file: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let range = PortRange::new(cli.port_min, cli.port_max).context("Invalid port range")?;
    let store = Arc::new(FilePortStore::new(&cli.map_file));
    let allocator = PortAllocator::open(range, store)
        .with_context(|| format!("Failed to load port map {:?}", cli.map_file))?;

    info!(
        "Allocating remote ports in {} (map file {:?})",
        range, cli.map_file
    );

    let config = PluginServerConfig {
        bind_addr: SocketAddr::new(cli.bind_host, cli.port),
    };
    PluginServer::new(config, Arc::new(allocator)).start().await
}
