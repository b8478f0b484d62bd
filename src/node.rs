//! Node supervisor
//!
//! Owns the shared state — config, viridian directory, packet pool — and
//! wires both listeners and the tunnel collaborator into one lifecycle under
//! a single cancellation tree: the root token feeds one child per listener,
//! and every session runs on a grandchild. Egress dispatch lives here too:
//! packets coming off the tunnel are routed to sessions by the peer-ID
//! embedded in their destination address.

use crate::buffer::{Buffer, PacketPool};
use crate::config::NodeConfig;
use crate::ipv4::read_ipv4;
use crate::port::PortListener;
use crate::proto::packet_pool;
use crate::tunnel::{TunnelIo, TunnelNetwork};
use crate::typhoon::TyphoonListener;
use crate::viridian::ViridianDirectory;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Node {
    config: Arc<NodeConfig>,
    directory: Arc<ViridianDirectory>,
    pool: Arc<PacketPool>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let directory = ViridianDirectory::new(config.max_viridians, config.max_admins);
        Self { config: Arc::new(config), directory, pool: Arc::new(packet_pool()) }
    }

    /// The pool tunnel drivers and tests should allocate packets from, so
    /// buffers entering the node carry protocol headroom.
    pub fn pool(&self) -> Arc<PacketPool> {
        self.pool.clone()
    }

    pub fn directory(&self) -> Arc<ViridianDirectory> {
        self.directory.clone()
    }

    /// Run both listeners and the egress dispatcher until the root token is
    /// cancelled, then drain every session.
    pub async fn run(
        &self,
        port_listener: TcpListener,
        typhoon_socket: UdpSocket,
        external_ip: IpAddr,
        tunnel: TunnelIo,
        cancel: CancellationToken,
    ) {
        let TunnelIo { network, to_device, from_device } = tunnel;

        let port = PortListener::new(
            self.config.clone(),
            self.directory.clone(),
            self.pool.clone(),
            to_device.clone(),
            network,
            external_ip,
        );
        let typhoon = TyphoonListener::new(
            self.config.clone(),
            self.directory.clone(),
            self.pool.clone(),
            to_device,
            network,
            external_ip,
        );

        let port_task = tokio::spawn(port.run(port_listener, cancel.child_token()));
        let typhoon_task = tokio::spawn(typhoon.run(typhoon_socket, cancel.child_token()));
        let egress_task = tokio::spawn(egress_dispatch(
            self.directory.clone(),
            self.pool.clone(),
            network,
            from_device,
            cancel.child_token(),
        ));

        cancel.cancelled().await;
        self.directory.clear().await;
        let _ = tokio::join!(port_task, typhoon_task, egress_task);
        info!("Whirlpool node stopped");
    }
}

/// Map each tunnel packet's destination back to a session and enqueue it.
/// Unroutable packets go back to the pool.
async fn egress_dispatch(
    directory: Arc<ViridianDirectory>,
    pool: Arc<PacketPool>,
    network: TunnelNetwork,
    mut from_device: mpsc::Receiver<Buffer>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = from_device.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        let destination = match read_ipv4(packet.slice()) {
            Ok((_, _, destination)) => destination,
            Err(err) => {
                debug!("Tunnel handed over a non-IPv4 packet: {err}");
                pool.put(packet);
                continue;
            }
        };
        let Some(peer_id) = network.peer_id_of(destination) else {
            debug!("Tunnel packet for {destination} matches no peer network");
            pool.put(packet);
            continue;
        };

        if let Err(packet) = directory.send_to(peer_id, packet).await {
            debug!("Peer {peer_id} unroutable, dropping egress packet");
            pool.put(packet);
        }
    }
}
