//! PORT end-to-end tests against a live node on loopback
//!
//! Run with: cargo test --test port_test -- --nocapture

use chrono::Utc;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use whirlpool::buffer::{Buffer, PacketPool};
use whirlpool::crypto::{Asymmetric, Symmetric, SYMMETRIC_OVERHEAD};
use whirlpool::ipv4::{read_ipv4, update_ipv4};
use whirlpool::proto::port::{
    build_client_init, build_frame, parse_frame_header, parse_server_init, PortClientInit, PortServerInit,
    PORT_FRAME_HEADER_WIRE, PORT_SERVER_INIT_WIRE,
};
use whirlpool::proto::{packet_pool, ReturnCode, FLAG_DATA, FLAG_TERM};
use whirlpool::token::ViridianToken;
use whirlpool::tunnel::{self, TunnelHandle, TunnelNetwork};
use whirlpool::{Node, NodeConfig, NodeKeys};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    keys: NodeKeys,
    pool: PacketPool,
    node_pool: Arc<PacketPool>,
    network: TunnelNetwork,
    port_addr: SocketAddr,
    tunnel: TunnelHandle,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_node(max_viridians: usize, max_admins: usize) -> Harness {
    let keys = NodeKeys::generate();
    let mut config = NodeConfig::with_keys(keys.clone());
    config.max_viridians = max_viridians;
    config.max_admins = max_admins;

    let port_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let typhoon_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port_addr = port_listener.local_addr().unwrap();

    let network = TunnelNetwork::new("10.8.0.0".parse().unwrap());
    let (tunnel_io, tunnel_handle) = tunnel::channel(network);

    let node = Node::new(config);
    let node_pool = node.pool();
    let cancel = CancellationToken::new();
    let run_token = cancel.clone();
    tokio::spawn(async move {
        node.run(port_listener, typhoon_socket, IpAddr::V4(Ipv4Addr::LOCALHOST), tunnel_io, run_token).await;
    });

    Harness { keys, pool: packet_pool(), node_pool, network, port_addr, tunnel: tunnel_handle, cancel }
}

fn make_token(identifier: &str, is_admin: bool, valid_secs: i64) -> ViridianToken {
    ViridianToken {
        name: identifier.to_string(),
        identifier: identifier.to_string(),
        is_admin,
        subscription: Some(prost_types::Timestamp { seconds: Utc::now().timestamp() + valid_secs, nanos: 0 }),
    }
}

/// Token double seal: server key inside, session key outside.
fn seal_token(harness: &Harness, session: &Symmetric, token: &ViridianToken) -> (u16, Buffer) {
    let bytes = token.to_vec();
    let mut plain = harness.pool.get(bytes.len()).unwrap();
    plain.slice_mut().copy_from_slice(&bytes);

    let inner = harness.keys.server_cipher().encrypt(plain, None).unwrap();
    let token_length = inner.len() as u16;
    (token_length, session.encrypt(inner, None).unwrap())
}

/// Run the full client init exchange; returns the session cipher and the
/// parsed server init.
async fn client_init(harness: &Harness, stream: &mut TcpStream, token: &ViridianToken) -> (Symmetric, PortServerInit) {
    let node_public = Asymmetric::from_bytes(&harness.keys.private.public_key()).unwrap();
    let bytes = token.to_vec();
    let token_length = (bytes.len() + SYMMETRIC_OVERHEAD) as u16;

    let tail_length = 7u16;
    let init = PortClientInit { client_type: 0, client_version: 1, token_length, tail_length };
    let (session_key, init_wire) = build_client_init(&node_public, init, &harness.pool).unwrap();
    let session = Symmetric::new(&session_key);

    let (sealed_length, token_wire) = seal_token(harness, &session, token);
    assert_eq!(sealed_length, token_length);

    stream.write_all(init_wire.slice()).await.unwrap();
    stream.write_all(token_wire.slice()).await.unwrap();
    stream.write_all(&vec![0xA5u8; tail_length as usize]).await.unwrap();

    let mut reply = [0u8; PORT_SERVER_INIT_WIRE];
    timeout(RECV_TIMEOUT, stream.read_exact(&mut reply)).await.unwrap().unwrap();
    let server_init = parse_server_init(&session, Buffer::from_slice(&reply)).unwrap();

    let mut tail = vec![0u8; server_init.tail_length as usize];
    timeout(RECV_TIMEOUT, stream.read_exact(&mut tail)).await.unwrap().unwrap();

    (session, server_init)
}

/// A minimal valid IPv4+UDP datagram with correct checksums.
fn ipv4_udp_packet(src: &str, dst: &str) -> Vec<u8> {
    let mut packet = vec![0u8; 36];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&36u16.to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&src.parse::<Ipv4Addr>().unwrap().octets());
    packet[16..20].copy_from_slice(&dst.parse::<Ipv4Addr>().unwrap().octets());
    packet[20..22].copy_from_slice(&40000u16.to_be_bytes());
    packet[22..24].copy_from_slice(&53u16.to_be_bytes());
    packet[24..26].copy_from_slice(&16u16.to_be_bytes());
    update_ipv4(&mut packet, None, None).unwrap();
    packet
}

/// Fold 16-bit big-endian words one's-complement style.
fn fold_sum(regions: &[&[u8]]) -> u16 {
    let mut acc: u32 = 0;
    for region in regions {
        let mut chunks = region.chunks_exact(2);
        for chunk in &mut chunks {
            acc += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        if let [last] = chunks.remainder() {
            acc += u32::from(u16::from_be_bytes([*last, 0]));
        }
    }
    while acc > 0xFFFF {
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    acc as u16
}

fn assert_checksums_valid(packet: &[u8]) {
    assert_eq!(fold_sum(&[&packet[..20]]), 0xFFFF, "IP header checksum");
    let segment = &packet[20..];
    let mut pseudo = [0u8; 12];
    pseudo[..4].copy_from_slice(&packet[12..16]);
    pseudo[4..8].copy_from_slice(&packet[16..20]);
    pseudo[9] = packet[9];
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    assert_eq!(fold_sum(&[&pseudo, segment]), 0xFFFF, "transport checksum");
}

#[tokio::test]
async fn test_port_happy_path_quota_and_eviction() {
    let mut harness = start_node(1, 0).await;

    // --- Happy path: init succeeds and the peer-ID is the data port.
    let mut ctrl = TcpStream::connect(harness.port_addr).await.unwrap();
    let (session, server_init) = client_init(&harness, &mut ctrl, &make_token("u1", false, 60)).await;
    assert_eq!(server_init.status, ReturnCode::Success);
    assert_ne!(server_init.peer_id, 0);

    let mut data = TcpStream::connect(("127.0.0.1", server_init.peer_id)).await.unwrap();
    assert_eq!(data.peer_addr().unwrap().port(), server_init.peer_id);

    // Inbound datagram is masqueraded onto the tunnel with valid checksums.
    let packet = ipv4_udp_packet("10.0.0.5", "8.8.8.8");
    let mut payload = harness.pool.get(packet.len()).unwrap();
    payload.slice_mut().copy_from_slice(&packet);
    let frame = build_frame(&session, FLAG_DATA, payload, 16, &harness.pool).unwrap();
    data.write_all(frame.slice()).await.unwrap();

    let forwarded = timeout(RECV_TIMEOUT, harness.tunnel.from_node.recv()).await.unwrap().unwrap();
    let (_, fwd_src, fwd_dst) = read_ipv4(forwarded.slice()).unwrap();
    assert_eq!(fwd_src, harness.network.peer_address(server_init.peer_id));
    assert_eq!(fwd_dst, "8.8.8.8".parse::<Ipv4Addr>().unwrap());
    assert_checksums_valid(forwarded.slice());

    // Egress: a tunnel packet for the peer address comes back framed with
    // the destination rewritten to the viridian's inner address.
    let reply = ipv4_udp_packet("8.8.8.8", &harness.network.peer_address(server_init.peer_id).to_string());
    let mut egress = harness.node_pool.get(reply.len()).unwrap();
    egress.slice_mut().copy_from_slice(&reply);
    harness.tunnel.to_node.send(egress).await.unwrap();

    let mut header_wire = [0u8; PORT_FRAME_HEADER_WIRE];
    timeout(RECV_TIMEOUT, data.read_exact(&mut header_wire)).await.unwrap().unwrap();
    let header = parse_frame_header(&session, Buffer::from_slice(&header_wire)).unwrap();
    assert_eq!(header.flag, FLAG_DATA);

    let mut body_wire = vec![0u8; header.data_length as usize];
    timeout(RECV_TIMEOUT, data.read_exact(&mut body_wire)).await.unwrap().unwrap();
    let body = session.decrypt(Buffer::from_slice(&body_wire), None).unwrap();
    let (_, _, inner_dst) = read_ipv4(body.slice()).unwrap();
    assert_eq!(inner_dst, "10.0.0.5".parse::<Ipv4Addr>().unwrap());

    let mut tail = vec![0u8; header.tail_length as usize];
    timeout(RECV_TIMEOUT, data.read_exact(&mut tail)).await.unwrap().unwrap();

    // --- Quota: the single slot is taken, a second identifier is refused.
    let mut second = TcpStream::connect(harness.port_addr).await.unwrap();
    let (_, refused) = client_init(&harness, &mut second, &make_token("u2", false, 60)).await;
    assert_eq!(refused.status, ReturnCode::RegistrationError);
    assert_eq!(refused.peer_id, 0);

    // --- Duplicate identifier: evicts the first session and succeeds.
    let mut third = TcpStream::connect(harness.port_addr).await.unwrap();
    let (_, replacement) = client_init(&harness, &mut third, &make_token("u1", false, 60)).await;
    assert_eq!(replacement.status, ReturnCode::Success);
    assert_ne!(replacement.peer_id, 0);

    // The evicted session closes, announced by a TERM frame or plain EOF.
    let mut closing = [0u8; PORT_FRAME_HEADER_WIRE];
    match timeout(RECV_TIMEOUT, data.read_exact(&mut closing)).await.unwrap() {
        Ok(_) => {
            let header = parse_frame_header(&session, Buffer::from_slice(&closing)).unwrap();
            assert_eq!(header.flag, FLAG_TERM);
        }
        Err(_) => {} // connection already torn down
    }
}

#[tokio::test]
async fn test_port_expired_subscription_rejected() {
    let harness = start_node(4, 0).await;

    let mut ctrl = TcpStream::connect(harness.port_addr).await.unwrap();
    let (_, server_init) = client_init(&harness, &mut ctrl, &make_token("stale", false, -30)).await;
    assert_eq!(server_init.status, ReturnCode::RegistrationError);
    assert_eq!(server_init.peer_id, 0);
}

#[tokio::test]
async fn test_port_admin_bypasses_viridian_quota() {
    let harness = start_node(1, 1).await;

    let mut first = TcpStream::connect(harness.port_addr).await.unwrap();
    let (_, occupant) = client_init(&harness, &mut first, &make_token("u1", false, 60)).await;
    assert_eq!(occupant.status, ReturnCode::Success);

    // A privileged token still fits in the overflow slot.
    let mut admin = TcpStream::connect(harness.port_addr).await.unwrap();
    let (_, admitted) = client_init(&harness, &mut admin, &make_token("root", true, 60)).await;
    assert_eq!(admitted.status, ReturnCode::Success);
    assert_ne!(admitted.peer_id, occupant.peer_id);
}
