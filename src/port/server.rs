//! Per-session PORT state machine
//!
//! Two tasks share one established data connection. The reader pulls frames
//! off the stream (header, body, tail, in that order), masquerades decrypted
//! datagrams onto the tunnel; the writer drains the session's egress channel,
//! rewrites destinations back to the viridian's inner address and frames them
//! out. Either side failing cancels the session token; the writer closes with
//! one best-effort TERM frame.

use crate::buffer::{Buffer, PacketPool};
use crate::config::NodeConfig;
use crate::crypto::{Symmetric, SYMMETRIC_OVERHEAD};
use crate::ipv4::{read_ipv4, update_ipv4};
use crate::proto::port::{build_frame, build_term, parse_frame_header, PORT_FRAME_HEADER_WIRE};
use crate::proto::FLAG_TERM;
use crate::tunnel::TunnelNetwork;
use crate::viridian::ViridianDirectory;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Egress channel depth per PORT session.
pub const PORT_INPUT_CAPACITY: usize = 5;

/// Grace period for the closing TERM frame.
const TERM_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Drive one established PORT session to completion.
#[allow(clippy::too_many_arguments)]
pub async fn run_port_session(
    config: Arc<NodeConfig>,
    pool: Arc<PacketPool>,
    directory: Arc<ViridianDirectory>,
    stream: TcpStream,
    cipher: Symmetric,
    peer_id: u16,
    input: mpsc::Receiver<Buffer>,
    tunnel: mpsc::Sender<Buffer>,
    network: TunnelNetwork,
    cancel: CancellationToken,
) {
    // The viridian's inner source address, learned from its traffic;
    // zero until the first datagram arrives.
    let inner_ip = Arc::new(AtomicU32::new(0));
    let (read_half, write_half) = stream.into_split();

    let reader = tokio::spawn(reader_task(
        pool.clone(),
        read_half,
        cipher.clone(),
        peer_id,
        inner_ip.clone(),
        tunnel,
        network,
        cancel.clone(),
    ));
    let writer = tokio::spawn(writer_task(
        config,
        pool,
        write_half,
        cipher,
        input,
        inner_ip,
        cancel.clone(),
    ));

    let _ = tokio::join!(reader, writer);
    cancel.cancel();
    directory.delete(peer_id, false).await;
    debug!("PORT session for peer {peer_id} closed");
}

#[allow(clippy::too_many_arguments)]
async fn reader_task(
    pool: Arc<PacketPool>,
    mut read_half: OwnedReadHalf,
    cipher: Symmetric,
    peer_id: u16,
    inner_ip: Arc<AtomicU32>,
    tunnel: mpsc::Sender<Buffer>,
    network: TunnelNetwork,
    cancel: CancellationToken,
) {
    let masqueraded = network.peer_address(peer_id);

    loop {
        let mut header_wire = [0u8; PORT_FRAME_HEADER_WIRE];
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            r = read_half.read_exact(&mut header_wire) => r,
        };
        if let Err(err) = read {
            debug!("PORT peer {peer_id} stream ended: {err}");
            break;
        }

        // A header that fails to open means the stream lost framing; there
        // is no way back into sync.
        let header = match parse_frame_header(&cipher, Buffer::from_slice(&header_wire)) {
            Ok(header) => header,
            Err(err) => {
                warn!("PORT peer {peer_id} sent a malformed frame: {err}");
                break;
            }
        };

        if header.flag == FLAG_TERM {
            debug!("PORT peer {peer_id} terminated the session");
            break;
        }

        if (header.data_length as usize) < SYMMETRIC_OVERHEAD {
            warn!("PORT peer {peer_id} advertised an impossible body length {}", header.data_length);
            break;
        }
        let mut body = match pool.get(header.data_length as usize) {
            Ok(body) => body,
            Err(err) => {
                warn!("PORT peer {peer_id} packet allocation failed: {err}");
                break;
            }
        };
        let read = tokio::select! {
            _ = cancel.cancelled() => { pool.put(body); break }
            r = read_half.read_exact(body.slice_mut()) => r,
        };
        if read.is_err() {
            pool.put(body);
            break;
        }
        if let Err(err) = drain(&mut read_half, header.tail_length as usize, &cancel).await {
            debug!("PORT peer {peer_id} tail read failed: {err}");
            pool.put(body);
            break;
        }

        // A bad body leaves the stream in sync, so the packet is dropped
        // and the session continues.
        let mut packet = match cipher.decrypt(body, None) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("PORT peer {peer_id} body rejected: {err}");
                continue;
            }
        };
        let source = match read_ipv4(packet.slice()) {
            Ok((_, source, _)) => source,
            Err(err) => {
                debug!("PORT peer {peer_id} sent a non-IPv4 payload: {err}");
                pool.put(packet);
                continue;
            }
        };
        inner_ip.store(u32::from(source), Ordering::Release);

        if let Err(err) = update_ipv4(packet.slice_mut(), Some(masqueraded), None) {
            debug!("PORT peer {peer_id} packet rewrite failed: {err}");
            pool.put(packet);
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => { break }
            sent = tunnel.send(packet) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    cancel.cancel();
}

async fn writer_task(
    config: Arc<NodeConfig>,
    pool: Arc<PacketPool>,
    mut write_half: OwnedWriteHalf,
    cipher: Symmetric,
    mut input: mpsc::Receiver<Buffer>,
    inner_ip: Arc<AtomicU32>,
    cancel: CancellationToken,
) {
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
            // No return route until the viridian has sent something.
            pool.put(packet);
            continue;
        }

        let mut packet = packet;
        if let Err(err) = update_ipv4(packet.slice_mut(), None, Some(inner)) {
            debug!("PORT egress rewrite failed: {err}");
            pool.put(packet);
            continue;
        }
        let frame = match build_frame(&cipher, crate::proto::FLAG_DATA, packet, config.port.max_tail_length, &pool) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("PORT egress framing failed: {err}");
                continue;
            }
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => { pool.put(frame); break }
            w = write_half.write_all(frame.slice()) => w,
        };
        pool.put(frame);
        if written.is_err() {
            break;
        }
    }

    // Release whatever egress packets were still queued.
    while let Ok(packet) = input.try_recv() {
        pool.put(packet);
    }

    if let Ok(term) = build_term(&cipher, config.port.max_tail_length, &pool) {
        let _ = tokio::time::timeout(TERM_WRITE_TIMEOUT, write_half.write_all(term.slice())).await;
        pool.put(term);
    }
    cancel.cancel();
}

/// Discard exactly `remaining` tail bytes.
async fn drain(read_half: &mut OwnedReadHalf, mut remaining: usize, cancel: &CancellationToken) -> std::io::Result<()> {
    let mut scratch = [0u8; 256];
    while remaining > 0 {
        let take = remaining.min(scratch.len());
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = read_half.read_exact(&mut scratch[..take]) => r?,
        };
        remaining -= take;
    }
    Ok(())
}
