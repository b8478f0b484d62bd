//! Whirlpool node binary
//!
//! Addresses and ports come from the command line (or their environment
//! fallbacks); keys, quotas and protocol tuning come from the environment
//! via [`NodeConfig::from_env`]. The tunnel device itself belongs to the
//! platform integration — until a driver attaches to the collaborator end,
//! masqueraded traffic is logged and dropped.

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use whirlpool::tunnel::{self, TunnelNetwork};
use whirlpool::{Node, NodeConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "whirlpool", version, about = "Whirlpool: VPN worker node")]
struct Args {
    /// Internal address the PORT and TYPHOON listeners bind on
    #[arg(short, long, env = "SEASIDE_ADDRESS", default_value = "0.0.0.0")]
    internal: IpAddr,

    /// External address per-peer sockets bind on
    #[arg(short, long, env = "SEASIDE_EXTERNAL", default_value = "0.0.0.0")]
    external: IpAddr,

    /// PORT (TCP) listener port
    #[arg(long, env = "SEASIDE_PORT_PORT", default_value = "29165")]
    port_port: u16,

    /// TYPHOON (UDP) listener port
    #[arg(long, env = "SEASIDE_TYPHOON_PORT", default_value = "29166")]
    typhoon_port: u16,

    /// Tunnel network; its first two octets prefix every peer address
    #[arg(long, env = "SEASIDE_TUNNEL_NETWORK", default_value = "10.8.0.0")]
    tunnel_network: Ipv4Addr,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("whirlpool=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let config = match NodeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Configuration rejected: {err}");
            return;
        }
    };

    info!("════════════════════════════════════════════════════════════");
    info!("  Whirlpool v{VERSION} — VPN worker node");
    info!("════════════════════════════════════════════════════════════");
    info!("Node pubkey: {}", hex::encode(config.keys.private.public_key()));
    info!(
        "Quotas: {} viridians + {} admins | PORT {}:{} | TYPHOON {}:{}",
        config.max_viridians, config.max_admins, args.internal, args.port_port, args.internal, args.typhoon_port
    );

    let port_listener = match TcpListener::bind((args.internal, args.port_port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("PORT bind failed: {err}");
            return;
        }
    };
    let typhoon_socket = match UdpSocket::bind((args.internal, args.typhoon_port)).await {
        Ok(socket) => socket,
        Err(err) => {
            error!("TYPHOON bind failed: {err}");
            return;
        }
    };

    let node = Node::new(config);
    let network = TunnelNetwork::new(args.tunnel_network);
    let (tunnel_io, tunnel_handle) = tunnel::channel(network);

    // Placeholder tunnel driver: the platform integration replaces this end
    // with the actual tun device pump.
    let pool = node.pool();
    tokio::spawn(async move {
        let _to_node = tunnel_handle.to_node;
        let mut from_node = tunnel_handle.from_node;
        while let Some(packet) = from_node.recv().await {
            debug!("No tunnel driver attached, dropping {} masqueraded bytes", packet.len());
            pool.put(packet);
        }
    });

    // Status printer
    let directory = node.directory();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            info!("Status: {} viridian sessions live", directory.count().await);
        }
    });

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        signal_token.cancel();
    });

    node.run(port_listener, typhoon_socket, args.external, tunnel_io, cancel).await;
}
