use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use sha2::{Digest, Sha256};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use weft::{Application, Message, Node, OverlayConfig, OverlayId, StaticSecret};

#[derive(Parser, Debug)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Overlay network to join.
    #[arg(short, long, default_value = "weft-demo")]
    overlay: String,

    /// Shared overlay passphrase; the static key is derived from it, so
    /// every node of the overlay must use the same value.
    #[arg(short, long, default_value = "weft-demo-secret")]
    secret: String,

    /// Interface to bind.
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// First UDP discovery probe port.
    #[arg(long, default_value = "33810")]
    probe_base: u16,

    /// Number of probe ports to scan.
    #[arg(long, default_value = "8")]
    probe_count: u16,
}

/// Logs every delivery; stand-in for a real application callback.
struct LogDeliveries;

impl Application for LogDeliveries {
    fn deliver(&self, msg: Message) {
        info!(
            meta = %hex::encode(&msg.head.meta),
            bytes = msg.data.len(),
            "message delivered"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let key = StaticSecret::from(<[u8; 32]>::from(Sha256::digest(args.secret.as_bytes())));
    let config = OverlayConfig {
        bind_ips: vec![args.bind],
        probe_ports: (args.probe_base..args.probe_base + args.probe_count).collect(),
        beacon_interval: Duration::from_secs(1),
        ..OverlayConfig::default()
    };

    let node = Node::with_config(
        OverlayId::from(args.overlay.as_str()),
        key,
        Arc::new(LogDeliveries),
        config,
    );
    node.boot().await?;
    info!(id = %node.node_id(), addrs = ?node.listen_addrs(), "node up");

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, exiting gracefully");
    node.shutdown().await;
    Ok(())
}
