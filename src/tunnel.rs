//! Tunnel collaborator boundary
//!
//! Allocating the tun device, programming the firewall and routing are the
//! platform integrator's job; the node only needs two packet streams and the
//! tunnel network prefix used for peer addressing. Ingress client payloads
//! flow to the device, egress device packets flow back and are dispatched by
//! peer-ID.

use crate::buffer::Buffer;
use std::net::Ipv4Addr;
use tokio::sync::mpsc;

/// Depth of the channel pair bridging the node and the device driver.
pub const TUNNEL_CHANNEL_CAPACITY: usize = 64;

/// The tunnel's IPv4 network; only the first two octets matter, the lower
/// half of every address inside it is a peer-ID.
#[derive(Clone, Copy, Debug)]
pub struct TunnelNetwork {
    prefix: [u8; 2],
}

impl TunnelNetwork {
    pub fn new(network: Ipv4Addr) -> Self {
        let octets = network.octets();
        Self { prefix: [octets[0], octets[1]] }
    }

    /// The tunnel-side address of a peer: `net0.net1.peerHi.peerLo`.
    pub fn peer_address(&self, peer_id: u16) -> Ipv4Addr {
        Ipv4Addr::new(self.prefix[0], self.prefix[1], (peer_id >> 8) as u8, peer_id as u8)
    }

    /// Recover the peer-ID from a tunnel-side address, when it is one.
    pub fn peer_id_of(&self, address: Ipv4Addr) -> Option<u16> {
        let octets = address.octets();
        if octets[0] == self.prefix[0] && octets[1] == self.prefix[1] {
            Some(u16::from_be_bytes([octets[2], octets[3]]))
        } else {
            None
        }
    }
}

/// The node's end of the tunnel: masqueraded client packets go out through
/// `to_device`, packets read off the device come back on `from_device`.
pub struct TunnelIo {
    pub network: TunnelNetwork,
    pub to_device: mpsc::Sender<Buffer>,
    pub from_device: mpsc::Receiver<Buffer>,
}

/// The collaborator's end: what a platform tunnel driver reads and writes.
pub struct TunnelHandle {
    pub from_node: mpsc::Receiver<Buffer>,
    pub to_node: mpsc::Sender<Buffer>,
}

/// A connected channel pair for the node and its tunnel driver.
pub fn channel(network: TunnelNetwork) -> (TunnelIo, TunnelHandle) {
    let (to_device, from_node) = mpsc::channel(TUNNEL_CHANNEL_CAPACITY);
    let (to_node, from_device) = mpsc::channel(TUNNEL_CHANNEL_CAPACITY);
    (TunnelIo { network, to_device, from_device }, TunnelHandle { from_node, to_node })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_addressing_roundtrip() {
        let network = TunnelNetwork::new("10.8.0.0".parse().unwrap());
        for peer_id in [0u16, 1, 255, 256, 40123, u16::MAX] {
            let address = network.peer_address(peer_id);
            assert_eq!(network.peer_id_of(address), Some(peer_id));
        }
        assert_eq!(network.peer_address(40123), "10.8.156.187".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_foreign_address_is_not_a_peer() {
        let network = TunnelNetwork::new("10.8.0.0".parse().unwrap());
        assert_eq!(network.peer_id_of("10.9.0.1".parse().unwrap()), None);
        assert_eq!(network.peer_id_of("8.8.8.8".parse().unwrap()), None);
    }
}
