use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

use vmdeck_web::Config;

#[derive(Parser)]
#[command(name = "vmdeck")]
#[command(author, version, about = "Proxmox VE dashboard with a noVNC console relay")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "vmdeck.toml", env = "VMDECK_CONFIG")]
    config: PathBuf,

    /// Listen address, overrides the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_env();
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    cfg.validate()?;

    let addr: SocketAddr = cfg.listen.parse()?;

    info!(
        "Starting vmdeck {} on http://{} ({} users, proxmox: {})",
        vmdeck_common::VERSION,
        addr,
        cfg.users.len(),
        cfg.proxmox.base_url()
    );

    vmdeck_web::server::serve(addr, cfg).await
}
