//! TYPHOON framing — the unreliable, adaptive protocol over UDP
//!
//! Each UDP datagram is one AEAD-sealed unit: the client init under the
//! node's asymmetric key (deriving the session key on the way), every other
//! message under the session cipher with no additional data. Header, optional
//! payload and the random tail all live inside the sealed plaintext, so
//! datagram boundaries reveal nothing but total length.
//!
//! Wire shapes (sealed content):
//!
//! ```text
//! client init   FLAG_INIT | pkt_no | type | version | next_in | tail_len || token || tail
//! server init   FLAG_INIT | pkt_no | status | peer_id | next_in | tail_len || tail
//! handshake     HDSK[|DATA] | pkt_no | next_in | tail_len [|| data] || tail
//! data / term   flag | tail_len [|| data] || tail
//! ```

use super::{fill_tail, random_tail_length, ProtocolError, ReturnCode, FLAG_DATA, FLAG_HDSK, FLAG_INIT, FLAG_TERM};
use crate::buffer::{Buffer, PacketPool};
use crate::crypto::{Asymmetric, Symmetric, SymmetricKey, ASYMMETRIC_OVERHEAD};

pub const TYPHOON_CLIENT_INIT_LEN: usize = 13;
pub const TYPHOON_SERVER_INIT_LEN: usize = 14;
pub const TYPHOON_HANDSHAKE_LEN: usize = 11;
pub const TYPHOON_PLAIN_LEN: usize = 3;

// =============================================================================
// CLIENT INIT
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct TyphoonClientInit {
    pub pkt_no: u32,
    pub client_type: u8,
    pub client_version: u8,
    /// Milliseconds until the client's first scheduled handshake.
    pub next_in: u32,
    pub tail_length: u16,
}

/// Seal a client init datagram to the node's public key; the token rides
/// between header and tail. Returns the derived session key.
pub fn build_client_init(
    node_public: &Asymmetric,
    pkt_no: u32,
    client_type: u8,
    client_version: u8,
    next_in: u32,
    token: &[u8],
    max_tail: usize,
    pool: &PacketPool,
) -> Result<(SymmetricKey, Buffer), ProtocolError> {
    let tail_length = random_tail_length(max_tail);

    let mut msg = pool.get(TYPHOON_CLIENT_INIT_LEN + token.len())?;
    let m = msg.slice_mut();
    m[0] = FLAG_INIT;
    m[1..5].copy_from_slice(&pkt_no.to_be_bytes());
    m[5] = client_type;
    m[6] = client_version;
    m[7..11].copy_from_slice(&next_in.to_be_bytes());
    m[11..13].copy_from_slice(&tail_length.to_be_bytes());
    m[TYPHOON_CLIENT_INIT_LEN..].copy_from_slice(token);

    let mut msg = msg.expand(0, tail_length as usize)?;
    let tail_start = msg.len() - tail_length as usize;
    fill_tail(&mut msg.slice_mut()[tail_start..]);

    Ok(node_public.encrypt(msg)?)
}

/// Open a client init datagram; yields the session key, the parsed header
/// and the token view.
pub fn parse_client_init(node_key: &Asymmetric, datagram: Buffer) -> Result<(SymmetricKey, TyphoonClientInit, Buffer), ProtocolError> {
    if datagram.len() < TYPHOON_CLIENT_INIT_LEN + ASYMMETRIC_OVERHEAD {
        return Err(ProtocolError::InvalidHeader("TYPHOON client init"));
    }
    let (session_key, plain) = node_key.decrypt(datagram)?;

    let m = plain.slice();
    if m[0] != FLAG_INIT {
        return Err(ProtocolError::UnknownFlag(m[0]));
    }
    let init = TyphoonClientInit {
        pkt_no: u32::from_be_bytes([m[1], m[2], m[3], m[4]]),
        client_type: m[5],
        client_version: m[6],
        next_in: u32::from_be_bytes([m[7], m[8], m[9], m[10]]),
        tail_length: u16::from_be_bytes([m[11], m[12]]),
    };
    let data_end = plain
        .len()
        .checked_sub(init.tail_length as usize)
        .filter(|end| *end >= TYPHOON_CLIENT_INIT_LEN)
        .ok_or(ProtocolError::InvalidHeader("TYPHOON client init"))?;

    let token = plain.rebuffer(TYPHOON_CLIENT_INIT_LEN, data_end);
    Ok((session_key, init, token))
}

// =============================================================================
// SERVER INIT
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct TyphoonServerInit {
    pub pkt_no: u32,
    pub status: ReturnCode,
    pub peer_id: u16,
    pub next_in: u32,
    pub tail_length: u16,
}

pub fn build_server_init(
    cipher: &Symmetric,
    pkt_no: u32,
    status: ReturnCode,
    peer_id: u16,
    next_in: u32,
    max_tail: usize,
    pool: &PacketPool,
) -> Result<Buffer, ProtocolError> {
    let tail_length = random_tail_length(max_tail);

    let mut msg = pool.get(TYPHOON_SERVER_INIT_LEN)?;
    let m = msg.slice_mut();
    m[0] = FLAG_INIT;
    m[1..5].copy_from_slice(&pkt_no.to_be_bytes());
    m[5] = status as u8;
    m[6..8].copy_from_slice(&peer_id.to_be_bytes());
    m[8..12].copy_from_slice(&next_in.to_be_bytes());
    m[12..14].copy_from_slice(&tail_length.to_be_bytes());

    let mut msg = msg.expand(0, tail_length as usize)?;
    fill_tail(&mut msg.slice_mut()[TYPHOON_SERVER_INIT_LEN..]);

    Ok(cipher.encrypt(msg, None)?)
}

pub fn parse_server_init(cipher: &Symmetric, datagram: Buffer) -> Result<TyphoonServerInit, ProtocolError> {
    let plain = cipher.decrypt(datagram, None)?;
    if plain.len() < TYPHOON_SERVER_INIT_LEN {
        return Err(ProtocolError::InvalidHeader("TYPHOON server init"));
    }

    let m = plain.slice();
    if m[0] != FLAG_INIT {
        return Err(ProtocolError::UnknownFlag(m[0]));
    }
    Ok(TyphoonServerInit {
        pkt_no: u32::from_be_bytes([m[1], m[2], m[3], m[4]]),
        status: ReturnCode::from_byte(m[5])?,
        peer_id: u16::from_be_bytes([m[6], m[7]]),
        next_in: u32::from_be_bytes([m[8], m[9], m[10], m[11]]),
        tail_length: u16::from_be_bytes([m[12], m[13]]),
    })
}

// =============================================================================
// SESSION MESSAGES
// =============================================================================

/// A decoded post-init datagram.
#[derive(Debug)]
pub enum TyphoonMessage {
    /// HDSK or HDSK|DATA: the consistency part, plus the shadow-ridden
    /// payload when present.
    Handshake { pkt_no: u32, next_in: u32, data: Option<Buffer> },
    Data(Buffer),
    Term,
}

/// Seal a handshake datagram; with `data` present this is the shadow-ridden
/// `HDSK|DATA` form, otherwise a bare HDSK.
pub fn build_handshake(
    cipher: &Symmetric,
    pkt_no: u32,
    next_in: u32,
    data: Option<Buffer>,
    max_tail: usize,
    pool: &PacketPool,
) -> Result<Buffer, ProtocolError> {
    let tail_length = random_tail_length(max_tail);
    let flag = match data {
        Some(_) => FLAG_HDSK | FLAG_DATA,
        None => FLAG_HDSK,
    };

    let mut header = [0u8; TYPHOON_HANDSHAKE_LEN];
    header[0] = flag;
    header[1..5].copy_from_slice(&pkt_no.to_be_bytes());
    header[5..9].copy_from_slice(&next_in.to_be_bytes());
    header[9..11].copy_from_slice(&tail_length.to_be_bytes());

    let msg = match data {
        Some(payload) => payload.prepend(&header)?,
        None => pool.get(0)?.prepend(&header)?,
    };
    let mut msg = msg.expand(0, tail_length as usize)?;
    let tail_start = msg.len() - tail_length as usize;
    fill_tail(&mut msg.slice_mut()[tail_start..]);

    Ok(cipher.encrypt(msg, None)?)
}

/// Seal a plain DATA datagram.
pub fn build_data(cipher: &Symmetric, payload: Buffer, max_tail: usize) -> Result<Buffer, ProtocolError> {
    let tail_length = random_tail_length(max_tail);

    let header = [FLAG_DATA, (tail_length >> 8) as u8, tail_length as u8];
    let mut msg = payload.prepend(&header)?.expand(0, tail_length as usize)?;
    let tail_start = msg.len() - tail_length as usize;
    fill_tail(&mut msg.slice_mut()[tail_start..]);

    Ok(cipher.encrypt(msg, None)?)
}

/// Seal a TERM datagram.
pub fn build_term(cipher: &Symmetric, max_tail: usize, pool: &PacketPool) -> Result<Buffer, ProtocolError> {
    let tail_length = random_tail_length(max_tail);

    let header = [FLAG_TERM, (tail_length >> 8) as u8, tail_length as u8];
    let mut msg = pool.get(0)?.prepend(&header)?.expand(0, tail_length as usize)?;
    fill_tail(&mut msg.slice_mut()[TYPHOON_PLAIN_LEN..]);

    Ok(cipher.encrypt(msg, None)?)
}

/// Open and dispatch a post-init datagram.
pub fn parse_message(cipher: &Symmetric, datagram: Buffer) -> Result<TyphoonMessage, ProtocolError> {
    let plain = cipher.decrypt(datagram, None)?;
    if plain.is_empty() {
        return Err(ProtocolError::InvalidHeader("TYPHOON message"));
    }

    let flag = plain.slice()[0];
    match flag {
        f if f == FLAG_HDSK || f == FLAG_HDSK | FLAG_DATA => {
            if plain.len() < TYPHOON_HANDSHAKE_LEN {
                return Err(ProtocolError::InvalidHeader("TYPHOON handshake"));
            }
            let m = plain.slice();
            let pkt_no = u32::from_be_bytes([m[1], m[2], m[3], m[4]]);
            let next_in = u32::from_be_bytes([m[5], m[6], m[7], m[8]]);
            let tail_length = u16::from_be_bytes([m[9], m[10]]) as usize;
            let data_end = plain
                .len()
                .checked_sub(tail_length)
                .filter(|end| *end >= TYPHOON_HANDSHAKE_LEN)
                .ok_or(ProtocolError::InvalidHeader("TYPHOON handshake"))?;

            let data = if f & FLAG_DATA != 0 {
                Some(plain.rebuffer(TYPHOON_HANDSHAKE_LEN, data_end))
            } else {
                None
            };
            Ok(TyphoonMessage::Handshake { pkt_no, next_in, data })
        }
        FLAG_DATA => {
            if plain.len() < TYPHOON_PLAIN_LEN {
                return Err(ProtocolError::InvalidHeader("TYPHOON data"));
            }
            let m = plain.slice();
            let tail_length = u16::from_be_bytes([m[1], m[2]]) as usize;
            let data_end = plain
                .len()
                .checked_sub(tail_length)
                .filter(|end| *end >= TYPHOON_PLAIN_LEN)
                .ok_or(ProtocolError::InvalidHeader("TYPHOON data"))?;
            Ok(TyphoonMessage::Data(plain.rebuffer(TYPHOON_PLAIN_LEN, data_end)))
        }
        FLAG_TERM => Ok(TyphoonMessage::Term),
        other => Err(ProtocolError::UnknownFlag(other)),
    }
}
