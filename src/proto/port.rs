//! PORT framing — the reliable, stream-oriented protocol over TCP
//!
//! Every header travels AEAD-sealed; the client init is sealed to the node's
//! asymmetric key (which also derives the session key), everything after it
//! to the session cipher. Each message ends in a random tail whose length
//! only the sealed header reveals.
//!
//! Wire shapes:
//!
//! ```text
//! client init   asym( FLAG_INIT | type | version | token_len | tail_len )   = 79 B
//! server init   sym ( FLAG_INIT | status | peer_id | tail_len ) || tail     = 46 B + tail
//! any other     sym ( flag | data_len | tail_len ) || sym(body) || tail     = 45 B + data_len + tail
//! ```

use super::{
    fill_tail, random_tail_length, ProtocolError, ReturnCode, FLAG_DATA, FLAG_INIT, FLAG_TERM, MAX_PROTOCOL_BODY,
};
use crate::buffer::{Buffer, PacketPool};
use crate::crypto::{Asymmetric, Symmetric, SymmetricKey, ASYMMETRIC_OVERHEAD, SYMMETRIC_OVERHEAD};

pub const PORT_CLIENT_INIT_LEN: usize = 7;
pub const PORT_SERVER_INIT_LEN: usize = 6;
pub const PORT_FRAME_HEADER_LEN: usize = 5;

/// On-wire sizes after sealing.
pub const PORT_CLIENT_INIT_WIRE: usize = PORT_CLIENT_INIT_LEN + ASYMMETRIC_OVERHEAD;
pub const PORT_SERVER_INIT_WIRE: usize = PORT_SERVER_INIT_LEN + SYMMETRIC_OVERHEAD;
pub const PORT_FRAME_HEADER_WIRE: usize = PORT_FRAME_HEADER_LEN + SYMMETRIC_OVERHEAD;

// =============================================================================
// CLIENT INIT
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct PortClientInit {
    pub client_type: u8,
    pub client_version: u8,
    /// Length of the session-sealed token message minus AEAD overhead.
    pub token_length: u16,
    pub tail_length: u16,
}

/// Seal a client init to the node's public key. Returns the derived session
/// key alongside the 79-byte wire message.
pub fn build_client_init(
    node_public: &Asymmetric,
    init: PortClientInit,
    pool: &PacketPool,
) -> Result<(SymmetricKey, Buffer), ProtocolError> {
    let mut header = pool.get(PORT_CLIENT_INIT_LEN)?;
    let h = header.slice_mut();
    h[0] = FLAG_INIT;
    h[1] = init.client_type;
    h[2] = init.client_version;
    h[3..5].copy_from_slice(&init.token_length.to_be_bytes());
    h[5..7].copy_from_slice(&init.tail_length.to_be_bytes());

    Ok(node_public.encrypt(header)?)
}

/// Open a client init with the node's private key.
pub fn parse_client_init(node_key: &Asymmetric, wire: Buffer) -> Result<(SymmetricKey, PortClientInit), ProtocolError> {
    if wire.len() != PORT_CLIENT_INIT_WIRE {
        return Err(ProtocolError::InvalidHeader("PORT client init"));
    }
    let (session_key, header) = node_key.decrypt(wire)?;
    if header.len() != PORT_CLIENT_INIT_LEN {
        return Err(ProtocolError::InvalidHeader("PORT client init"));
    }

    let h = header.slice();
    if h[0] != FLAG_INIT {
        return Err(ProtocolError::UnknownFlag(h[0]));
    }
    let init = PortClientInit {
        client_type: h[1],
        client_version: h[2],
        token_length: u16::from_be_bytes([h[3], h[4]]),
        tail_length: u16::from_be_bytes([h[5], h[6]]),
    };
    Ok((session_key, init))
}

// =============================================================================
// SERVER INIT
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct PortServerInit {
    pub status: ReturnCode,
    pub peer_id: u16,
    pub tail_length: u16,
}

/// Seal a server init under the session cipher, random tail included.
pub fn build_server_init(
    cipher: &Symmetric,
    status: ReturnCode,
    peer_id: u16,
    max_tail: usize,
    pool: &PacketPool,
) -> Result<Buffer, ProtocolError> {
    let tail_length = random_tail_length(max_tail);

    let mut header = pool.get(PORT_SERVER_INIT_LEN)?;
    let h = header.slice_mut();
    h[0] = FLAG_INIT;
    h[1] = status as u8;
    h[2..4].copy_from_slice(&peer_id.to_be_bytes());
    h[4..6].copy_from_slice(&tail_length.to_be_bytes());

    let mut framed = cipher.encrypt(header, None)?.expand(0, tail_length as usize)?;
    fill_tail(&mut framed.slice_mut()[PORT_SERVER_INIT_WIRE..]);
    Ok(framed)
}

/// Parse the fixed 46-byte server init; the caller drains `tail_length`
/// bytes afterwards.
pub fn parse_server_init(cipher: &Symmetric, wire: Buffer) -> Result<PortServerInit, ProtocolError> {
    if wire.len() != PORT_SERVER_INIT_WIRE {
        return Err(ProtocolError::InvalidHeader("PORT server init"));
    }
    let header = cipher.decrypt(wire, None)?;

    let h = header.slice();
    if h[0] != FLAG_INIT {
        return Err(ProtocolError::UnknownFlag(h[0]));
    }
    Ok(PortServerInit {
        status: ReturnCode::from_byte(h[1])?,
        peer_id: u16::from_be_bytes([h[2], h[3]]),
        tail_length: u16::from_be_bytes([h[4], h[5]]),
    })
}

// =============================================================================
// DATA / TERM FRAMES
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct PortFrameHeader {
    pub flag: u8,
    /// Sealed body length on the wire (payload plus AEAD overhead).
    pub data_length: u16,
    pub tail_length: u16,
}

/// Frame a payload: sealed header, sealed body, random tail, one contiguous
/// buffer ready for a single write.
pub fn build_frame(cipher: &Symmetric, flag: u8, payload: Buffer, max_tail: usize, pool: &PacketPool) -> Result<Buffer, ProtocolError> {
    if payload.len() > MAX_PROTOCOL_BODY {
        return Err(ProtocolError::InvalidHeader("oversized PORT body"));
    }
    let body = cipher.encrypt(payload, None)?;
    let data_length = body.len() as u16;
    let tail_length = random_tail_length(max_tail);

    let mut header = pool.get(PORT_FRAME_HEADER_LEN)?;
    let h = header.slice_mut();
    h[0] = flag;
    h[1..3].copy_from_slice(&data_length.to_be_bytes());
    h[3..5].copy_from_slice(&tail_length.to_be_bytes());
    let header_wire = cipher.encrypt(header, None)?;

    let framed = body.prepend_buffer(&header_wire)?;
    pool.put(header_wire);

    let mut framed = framed.expand(0, tail_length as usize)?;
    let tail_start = framed.len() - tail_length as usize;
    fill_tail(&mut framed.slice_mut()[tail_start..]);
    Ok(framed)
}

/// A body-less TERM frame with a random tail.
pub fn build_term(cipher: &Symmetric, max_tail: usize, pool: &PacketPool) -> Result<Buffer, ProtocolError> {
    let tail_length = random_tail_length(max_tail);

    let mut header = pool.get(PORT_FRAME_HEADER_LEN)?;
    let h = header.slice_mut();
    h[0] = FLAG_TERM;
    h[1..3].fill(0);
    h[3..5].copy_from_slice(&tail_length.to_be_bytes());

    let mut framed = cipher.encrypt(header, None)?.expand(0, tail_length as usize)?;
    fill_tail(&mut framed.slice_mut()[PORT_FRAME_HEADER_WIRE..]);
    Ok(framed)
}

/// Open the fixed 45-byte frame header. Only DATA and TERM may appear after
/// init; anything else is malformed.
pub fn parse_frame_header(cipher: &Symmetric, wire: Buffer) -> Result<PortFrameHeader, ProtocolError> {
    if wire.len() != PORT_FRAME_HEADER_WIRE {
        return Err(ProtocolError::InvalidHeader("PORT frame"));
    }
    let header = cipher.decrypt(wire, None)?;

    let h = header.slice();
    if h[0] != FLAG_DATA && h[0] != FLAG_TERM {
        return Err(ProtocolError::UnknownFlag(h[0]));
    }
    Ok(PortFrameHeader {
        flag: h[0],
        data_length: u16::from_be_bytes([h[1], h[2]]),
        tail_length: u16::from_be_bytes([h[3], h[4]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::packet_pool;

    #[test]
    fn test_client_init_roundtrip() {
        let pool = packet_pool();
        let node = Asymmetric::generate();
        let public = Asymmetric::from_bytes(&node.public_key()).unwrap();

        let init = PortClientInit { client_type: 2, client_version: 1, token_length: 133, tail_length: 57 };
        let (client_key, wire) = build_client_init(&public, init, &pool).unwrap();
        assert_eq!(wire.len(), PORT_CLIENT_INIT_WIRE);

        let (server_key, parsed) = parse_client_init(&node, wire).unwrap();
        assert_eq!(client_key, server_key);
        assert_eq!(parsed.client_type, 2);
        assert_eq!(parsed.client_version, 1);
        assert_eq!(parsed.token_length, 133);
        assert_eq!(parsed.tail_length, 57);
    }

    #[test]
    fn test_server_init_roundtrip() {
        let pool = packet_pool();
        let (_, cipher) = Symmetric::generate();

        for _ in 0..8 {
            let wire = build_server_init(&cipher, ReturnCode::Success, 40123, 64, &pool).unwrap();
            let tail = wire.len() - PORT_SERVER_INIT_WIRE;
            assert!(tail <= 64);

            let header = wire.rebuffer(0, PORT_SERVER_INIT_WIRE);
            let parsed = parse_server_init(&cipher, header).unwrap();
            assert_eq!(parsed.status, ReturnCode::Success);
            assert_eq!(parsed.peer_id, 40123);
            assert_eq!(parsed.tail_length as usize, tail);
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let pool = packet_pool();
        let (_, cipher) = Symmetric::generate();

        let mut payload = pool.get(200).unwrap();
        for (i, b) in payload.slice_mut().iter_mut().enumerate() {
            *b = i as u8;
        }

        let wire = build_frame(&cipher, FLAG_DATA, payload, 32, &pool).unwrap();
        let total = wire.len();

        let header_wire = wire.rebuffer(0, PORT_FRAME_HEADER_WIRE);
        let header = parse_frame_header(&cipher, header_wire).unwrap();
        assert_eq!(header.flag, FLAG_DATA);
        assert_eq!(header.data_length as usize, 200 + SYMMETRIC_OVERHEAD);
        assert_eq!(
            total,
            PORT_FRAME_HEADER_WIRE + header.data_length as usize + header.tail_length as usize
        );
    }

    #[test]
    fn test_frame_body_decrypts() {
        let pool = packet_pool();
        let (_, cipher) = Symmetric::generate();

        let mut payload = pool.get(64).unwrap();
        payload.slice_mut().fill(0x5A);
        let wire = build_frame(&cipher, FLAG_DATA, payload, 0, &pool).unwrap();

        let body = wire.rebuffer(PORT_FRAME_HEADER_WIRE, PORT_FRAME_HEADER_WIRE + 64 + SYMMETRIC_OVERHEAD);
        let opened = cipher.decrypt(body, None).unwrap();
        assert_eq!(opened.slice(), &[0x5A; 64]);
    }

    #[test]
    fn test_term_has_empty_body() {
        let pool = packet_pool();
        let (_, cipher) = Symmetric::generate();

        let wire = build_term(&cipher, 16, &pool).unwrap();
        let header = parse_frame_header(&cipher, wire.rebuffer(0, PORT_FRAME_HEADER_WIRE)).unwrap();
        assert_eq!(header.flag, FLAG_TERM);
        assert_eq!(header.data_length, 0);
    }

    #[test]
    fn test_unexpected_flag_rejected() {
        let pool = packet_pool();
        let (_, cipher) = Symmetric::generate();

        let mut header = pool.get(PORT_FRAME_HEADER_LEN).unwrap();
        header.slice_mut()[0] = FLAG_INIT;
        let wire = cipher.encrypt(header, None).unwrap();
        assert!(matches!(parse_frame_header(&cipher, wire), Err(ProtocolError::UnknownFlag(f)) if f == FLAG_INIT));
    }

    #[test]
    fn test_wrong_session_key_rejected() {
        let pool = packet_pool();
        let (_, cipher) = Symmetric::generate();
        let (_, other) = Symmetric::generate();

        let wire = build_server_init(&cipher, ReturnCode::Success, 7, 0, &pool).unwrap();
        assert!(parse_server_init(&other, wire).is_err());
    }
}
