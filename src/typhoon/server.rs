//! Per-session TYPHOON state machine
//!
//! Four moving parts per session: a reader dispatching decrypted datagrams,
//! a writer draining egress traffic, the control loop running the adaptive
//! handshake schedule, and the session supervisor joining them. Handshake
//! acknowledgments prefer to ride on outbound data ("shadow-riding"): the
//! control loop parks the pending packet number in a single-slot cell, the
//! writer stamps it onto its next packet, and only if no packet leaves
//! within two RTTs does the control loop send a bare handshake itself.

use super::clock::TyphoonClock;
use crate::buffer::{Buffer, PacketPool};
use crate::config::NodeConfig;
use crate::crypto::Symmetric;
use crate::ipv4::{read_ipv4, update_ipv4};
use crate::proto::typhoon::{
    build_data, build_handshake, build_server_init, build_term, parse_message, TyphoonMessage,
};
use crate::proto::ReturnCode;
use crate::tunnel::TunnelNetwork;
use crate::viridian::ViridianDirectory;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Egress channel depth per TYPHOON session.
pub const TYPHOON_INPUT_CAPACITY: usize = 16;

/// The consistency part of a client handshake: its packet number and the
/// interval after which the client schedules its next handshake.
#[derive(Clone, Copy, Debug)]
pub struct Consistency {
    pub pkt_no: u32,
    pub next_in: u32,
}

/// Single-slot hand-off between control loop and writer. At most one
/// piggyback request is ever in flight; whoever takes it owns sending the
/// handshake.
struct PiggybackSlot(Mutex<Option<u32>>);

impl PiggybackSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(None)))
    }

    fn offer(&self, pkt_no: u32) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(pkt_no);
    }

    fn take(&self) -> Option<u32> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
    }
}

/// Drive one registered TYPHOON session: connect-phase retransmission, then
/// the steady decay loop, until termination or retry exhaustion.
#[allow(clippy::too_many_arguments)]
pub async fn run_typhoon_session(
    config: Arc<NodeConfig>,
    pool: Arc<PacketPool>,
    directory: Arc<ViridianDirectory>,
    socket: Arc<UdpSocket>,
    cipher: Symmetric,
    peer_id: u16,
    initial: Consistency,
    input: mpsc::Receiver<Buffer>,
    tunnel: mpsc::Sender<Buffer>,
    network: TunnelNetwork,
    cancel: CancellationToken,
) {
    let clock = Arc::new(TyphoonClock::new(config.typhoon.clone()));
    let slot = PiggybackSlot::new();
    let inner_ip = Arc::new(AtomicU32::new(0));
    let (decay_tx, decay_rx) = mpsc::unbounded_channel();

    let reader = tokio::spawn(reader_task(
        config.clone(),
        pool.clone(),
        socket.clone(),
        cipher.clone(),
        peer_id,
        inner_ip.clone(),
        clock.clone(),
        decay_tx,
        tunnel,
        network,
        cancel.clone(),
    ));
    let writer = tokio::spawn(writer_task(
        config.clone(),
        pool.clone(),
        socket.clone(),
        cipher.clone(),
        input,
        inner_ip,
        clock.clone(),
        slot.clone(),
        cancel.clone(),
    ));
    let control = tokio::spawn(control_task(
        config,
        pool,
        socket,
        cipher,
        peer_id,
        initial,
        clock,
        slot,
        decay_rx,
        cancel.clone(),
    ));

    let _ = tokio::join!(reader, writer, control);
    cancel.cancel();
    directory.delete(peer_id, false).await;
    debug!("TYPHOON session for peer {peer_id} closed");
}

// =============================================================================
// READER
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn reader_task(
    config: Arc<NodeConfig>,
    pool: Arc<PacketPool>,
    socket: Arc<UdpSocket>,
    cipher: Symmetric,
    peer_id: u16,
    inner_ip: Arc<AtomicU32>,
    clock: Arc<TyphoonClock>,
    decay: mpsc::UnboundedSender<Consistency>,
    tunnel: mpsc::Sender<Buffer>,
    network: TunnelNetwork,
    cancel: CancellationToken,
) {
    let masqueraded = network.peer_address(peer_id);
    let typhoon = &config.typhoon;

    loop {
        let mut datagram = pool.get_full();
        let received = tokio::select! {
            _ = cancel.cancelled() => { pool.put(datagram); break }
            received = socket.recv(datagram.slice_mut()) => received,
        };
        let length = match received {
            Ok(length) => length,
            Err(err) => {
                debug!("TYPHOON peer {peer_id} socket read failed: {err}");
                pool.put(datagram);
                break;
            }
        };
        let datagram = datagram.rebuffer(0, length);

        match parse_message(&cipher, datagram) {
            Ok(TyphoonMessage::Data(packet)) => {
                if forward(&pool, &tunnel, &inner_ip, masqueraded, peer_id, packet, &cancel).await.is_err() {
                    break;
                }
            }
            Ok(TyphoonMessage::Handshake { pkt_no, next_in, data }) => {
                clock.handshake_received();
                if (typhoon.min_next_in..=typhoon.max_next_in).contains(&next_in) {
                    let _ = decay.send(Consistency { pkt_no, next_in });
                } else {
                    debug!("TYPHOON peer {peer_id} advertised out-of-range interval {next_in} ms");
                }
                if let Some(packet) = data {
                    if forward(&pool, &tunnel, &inner_ip, masqueraded, peer_id, packet, &cancel).await.is_err() {
                        break;
                    }
                }
            }
            Ok(TyphoonMessage::Term) => {
                debug!("TYPHOON peer {peer_id} terminated the session");
                break;
            }
            Err(err) => {
                // Datagrams are self-contained; a bad one costs nothing.
                debug!("TYPHOON peer {peer_id} datagram rejected: {err}");
            }
        }
    }

    cancel.cancel();
}

/// Masquerade one decrypted client packet onto the tunnel.
async fn forward(
    pool: &PacketPool,
    tunnel: &mpsc::Sender<Buffer>,
    inner_ip: &AtomicU32,
    masqueraded: Ipv4Addr,
    peer_id: u16,
    mut packet: Buffer,
    cancel: &CancellationToken,
) -> Result<(), ()> {
    let source = match read_ipv4(packet.slice()) {
        Ok((_, source, _)) => source,
        Err(err) => {
            debug!("TYPHOON peer {peer_id} sent a non-IPv4 payload: {err}");
            pool.put(packet);
            return Ok(());
        }
    };
    inner_ip.store(u32::from(source), Ordering::Release);

    if let Err(err) = update_ipv4(packet.slice_mut(), Some(masqueraded), None) {
        debug!("TYPHOON peer {peer_id} packet rewrite failed: {err}");
        pool.put(packet);
        return Ok(());
    }

    tokio::select! {
        _ = cancel.cancelled() => Err(()),
        sent = tunnel.send(packet) => sent.map_err(|_| ()),
    }
}

// =============================================================================
// WRITER
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn writer_task(
    config: Arc<NodeConfig>,
    pool: Arc<PacketPool>,
    socket: Arc<UdpSocket>,
    cipher: Symmetric,
    mut input: mpsc::Receiver<Buffer>,
    inner_ip: Arc<AtomicU32>,
    clock: Arc<TyphoonClock>,
    slot: Arc<PiggybackSlot>,
    cancel: CancellationToken,
) {
    let max_tail = config.typhoon.max_tail_length;

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = input.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        let inner = Ipv4Addr::from(inner_ip.load(Ordering::Acquire));
        if inner.is_unspecified() {
            pool.put(packet);
            continue;
        }
        let mut packet = packet;
        if let Err(err) = update_ipv4(packet.slice_mut(), None, Some(inner)) {
            debug!("TYPHOON egress rewrite failed: {err}");
            pool.put(packet);
            continue;
        }

        // Shadow-ride a pending handshake when the control loop parked one.
        let wire = match slot.take() {
            Some(pkt_no) => {
                let next_in = clock.regenerate_next_in(1.0, true);
                build_handshake(&cipher, pkt_no, next_in, Some(packet), max_tail, &pool)
            }
            None => build_data(&cipher, packet, max_tail),
        };
        let wire = match wire {
            Ok(wire) => wire,
            Err(err) => {
                warn!("TYPHOON egress framing failed: {err}");
                continue;
            }
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => { pool.put(wire); break }
            sent = socket.send(wire.slice()) => sent,
        };
        pool.put(wire);
        if sent.is_err() {
            break;
        }
    }

    while let Ok(packet) = input.try_recv() {
        pool.put(packet);
    }

    if let Ok(term) = build_term(&cipher, max_tail, &pool) {
        let _ = socket.send(term.slice()).await;
        pool.put(term);
    }
    cancel.cancel();
}

// =============================================================================
// CONTROL
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn control_task(
    config: Arc<NodeConfig>,
    pool: Arc<PacketPool>,
    socket: Arc<UdpSocket>,
    cipher: Symmetric,
    peer_id: u16,
    initial: Consistency,
    clock: Arc<TyphoonClock>,
    slot: Arc<PiggybackSlot>,
    mut decay: mpsc::UnboundedReceiver<Consistency>,
    cancel: CancellationToken,
) {
    let typhoon = &config.typhoon;
    let max_tail = typhoon.max_tail_length;

    // Connect phase: honour the client's advertised interval, then announce
    // the session until the first scheduled handshake confirms it.
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = sleep(Duration::from_millis(initial.next_in as u64)) => {}
    }

    let mut cons = None;
    for attempt in 0..typhoon.max_retries {
        let next_in = clock.regenerate_next_in(typhoon.initial_next_in, false);
        let frame = match build_server_init(&cipher, initial.pkt_no, ReturnCode::Success, peer_id, next_in, max_tail, &pool) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("TYPHOON peer {peer_id} init framing failed: {err}");
                cancel.cancel();
                return;
            }
        };
        let sent = socket.send(frame.slice()).await;
        pool.put(frame);
        if let Err(err) = sent {
            debug!("TYPHOON peer {peer_id} init send failed: {err}");
            cancel.cancel();
            return;
        }

        let wait = next_in as u64 + 2 * clock.get_rtt() as u64 + clock.get_timeout() as u64;
        tokio::select! {
            _ = cancel.cancelled() => return,
            answer = decay.recv() => match answer {
                Some(answer) => { cons = Some(answer); break }
                None => return,
            },
            _ = sleep(Duration::from_millis(wait)) => {
                debug!("TYPHOON peer {peer_id} init attempt {} unanswered", attempt + 1);
            }
        }
    }
    let Some(mut cons) = cons else {
        warn!("TYPHOON peer {peer_id} never confirmed the session");
        cancel.cancel();
        return;
    };

    // Decay phase: wait out each scheduled client handshake, probe with
    // shadow-ridden or bare handshakes when it fails to arrive.
    'decay: loop {
        let wait = cons.next_in.saturating_sub(clock.get_rtt());
        tokio::select! {
            _ = cancel.cancelled() => return,
            early = decay.recv() => match early {
                Some(early) => { cons = early; continue 'decay }
                None => return,
            },
            _ = sleep(Duration::from_millis(wait as u64)) => {}
        }

        let mut answered = false;
        for attempt in 0..typhoon.max_retries {
            slot.offer(cons.pkt_no);

            tokio::select! {
                _ = cancel.cancelled() => { slot.take(); return }
                answer = decay.recv() => match answer {
                    Some(answer) => { slot.take(); cons = answer; answered = true }
                    None => { slot.take(); return }
                },
                _ = sleep(Duration::from_millis(2 * clock.get_rtt() as u64)) => {
                    // The writer had two RTTs to ride the handshake out; if
                    // the slot is still ours, fall back to a bare one.
                    if let Some(pkt_no) = slot.take() {
                        let next_in = clock.regenerate_next_in(1.0, true);
                        match build_handshake(&cipher, pkt_no, next_in, None, max_tail, &pool) {
                            Ok(frame) => {
                                let sent = socket.send(frame.slice()).await;
                                pool.put(frame);
                                if let Err(err) = sent {
                                    debug!("TYPHOON peer {peer_id} handshake send failed: {err}");
                                    cancel.cancel();
                                    return;
                                }
                            }
                            Err(err) => warn!("TYPHOON peer {peer_id} handshake framing failed: {err}"),
                        }
                    }
                }
            }
            if answered {
                break;
            }

            let wait = clock.previous_next_in() as u64 + clock.get_rtt() as u64 + clock.get_timeout() as u64;
            tokio::select! {
                _ = cancel.cancelled() => return,
                answer = decay.recv() => match answer {
                    Some(answer) => { cons = answer; answered = true }
                    None => return,
                },
                _ = sleep(Duration::from_millis(wait)) => {
                    debug!("TYPHOON peer {peer_id} handshake attempt {} unanswered", attempt + 1);
                }
            }
            if answered {
                break;
            }
        }

        if !answered {
            warn!("TYPHOON peer {peer_id} stopped answering handshakes, failing the session");
            cancel.cancel();
            return;
        }
    }
}
