//! IPv4 datagram inspection and address rewriting
//!
//! The node masquerades client traffic: inbound packets get their source
//! rewritten to the tunnel-side peer address, outbound replies get their
//! destination rewritten back to the viridian's inner address. Every rewrite
//! recomputes the IPv4 header checksum and the transport checksum (ICMP, or
//! TCP/UDP over the pseudo-header), so packets leave the node verifiable.

use std::net::Ipv4Addr;
use thiserror::Error;

const MIN_HEADER_LEN: usize = 20;

const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

#[derive(Error, Debug)]
pub enum Ipv4Error {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("header length field invalid: {0} bytes")]
    BadHeaderLength(usize),

    #[error("total length field invalid: {0} bytes")]
    BadTotalLength(usize),

    #[error("transport segment truncated: {0} bytes")]
    TruncatedSegment(usize),

    #[error("unsupported transport protocol: {0}")]
    UnsupportedProtocol(u8),
}

/// Parse the addressing essentials of an IPv4 datagram.
pub fn read_ipv4(packet: &[u8]) -> Result<(u16, Ipv4Addr, Ipv4Addr), Ipv4Error> {
    if packet.len() < MIN_HEADER_LEN {
        return Err(Ipv4Error::TooShort(packet.len()));
    }
    let header_len = ((packet[0] & 0x0F) as usize) * 4;
    if header_len < MIN_HEADER_LEN {
        return Err(Ipv4Error::BadHeaderLength(header_len));
    }

    let total_length = u16::from_be_bytes([packet[2], packet[3]]);
    let source = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let destination = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    Ok((total_length, source, destination))
}

/// Overwrite source and/or destination address and restore all checksums.
///
/// The IPv4 header checksum is always recomputed; the transport checksum is
/// recomputed per protocol — ICMP over the segment alone, TCP and UDP over
/// the RFC 793/768 pseudo-header plus the segment. A computed UDP checksum
/// of zero is transmitted as `0xFFFF` (zero means "no checksum" on the
/// wire); TCP keeps the zero.
pub fn update_ipv4(packet: &mut [u8], new_src: Option<Ipv4Addr>, new_dst: Option<Ipv4Addr>) -> Result<(), Ipv4Error> {
    if packet.len() < MIN_HEADER_LEN {
        return Err(Ipv4Error::TooShort(packet.len()));
    }
    let header_len = ((packet[0] & 0x0F) as usize) * 4;
    if header_len < MIN_HEADER_LEN || header_len > packet.len() {
        return Err(Ipv4Error::BadHeaderLength(header_len));
    }
    let total_length = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if total_length < header_len || total_length > packet.len() {
        return Err(Ipv4Error::BadTotalLength(total_length));
    }

    if let Some(src) = new_src {
        packet[12..16].copy_from_slice(&src.octets());
    }
    if let Some(dst) = new_dst {
        packet[16..20].copy_from_slice(&dst.octets());
    }

    packet[10..12].fill(0);
    let header_checksum = finalize(sum_bytes(0, &packet[..header_len]));
    packet[10..12].copy_from_slice(&header_checksum.to_be_bytes());

    let protocol = packet[9];
    let segment_len = total_length - header_len;
    let mut pseudo = [0u8; 12];
    pseudo[..4].copy_from_slice(&packet[12..16]);
    pseudo[4..8].copy_from_slice(&packet[16..20]);
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&(segment_len as u16).to_be_bytes());

    let segment = &mut packet[header_len..total_length];
    match protocol {
        PROTO_ICMP => {
            if segment.len() < 4 {
                return Err(Ipv4Error::TruncatedSegment(segment.len()));
            }
            segment[2..4].fill(0);
            let checksum = finalize(sum_bytes(0, segment));
            segment[2..4].copy_from_slice(&checksum.to_be_bytes());
        }
        PROTO_TCP => {
            if segment.len() < 20 {
                return Err(Ipv4Error::TruncatedSegment(segment.len()));
            }
            segment[16..18].fill(0);
            let checksum = finalize(sum_bytes(sum_bytes(0, &pseudo), segment));
            segment[16..18].copy_from_slice(&checksum.to_be_bytes());
        }
        PROTO_UDP => {
            if segment.len() < 8 {
                return Err(Ipv4Error::TruncatedSegment(segment.len()));
            }
            segment[6..8].fill(0);
            let mut checksum = finalize(sum_bytes(sum_bytes(0, &pseudo), segment));
            if checksum == 0 {
                checksum = 0xFFFF;
            }
            segment[6..8].copy_from_slice(&checksum.to_be_bytes());
        }
        other => return Err(Ipv4Error::UnsupportedProtocol(other)),
    }

    Ok(())
}

/// Accumulate 16-bit big-endian words into a running one's-complement sum.
/// An odd trailing byte is padded with zero, per RFC 1071.
fn sum_bytes(mut acc: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        acc += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        acc += u32::from(u16::from_be_bytes([*last, 0]));
    }
    acc
}

/// Fold carries and complement.
fn finalize(mut acc: u32) -> u16 {
    while acc > 0xFFFF {
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    !(acc as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 20-byte header + transport segment, lengths and protocol filled in.
    fn build_packet(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> Vec<u8> {
        let total = MIN_HEADER_LEN + segment.len();
        let mut packet = vec![0u8; total];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        packet[8] = 64;
        packet[9] = protocol;
        packet[12..16].copy_from_slice(&src.octets());
        packet[16..20].copy_from_slice(&dst.octets());
        packet
    }

    /// One's-complement verification: summing a region including its stored
    /// checksum folds to 0xFFFF.
    fn verifies(acc: u32) -> bool {
        let mut acc = acc;
        while acc > 0xFFFF {
            acc = (acc & 0xFFFF) + (acc >> 16);
        }
        acc == 0xFFFF
    }

    fn header_verifies(packet: &[u8]) -> bool {
        verifies(sum_bytes(0, &packet[..MIN_HEADER_LEN]))
    }

    fn transport_verifies(packet: &[u8]) -> bool {
        let total = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        let segment = &packet[MIN_HEADER_LEN..total];
        let mut pseudo = [0u8; 12];
        pseudo[..4].copy_from_slice(&packet[12..16]);
        pseudo[4..8].copy_from_slice(&packet[16..20]);
        pseudo[9] = packet[9];
        pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
        verifies(sum_bytes(sum_bytes(0, &pseudo), segment))
    }

    #[test]
    fn test_read_ipv4() {
        let packet = build_packet(PROTO_UDP, "10.0.0.5".parse().unwrap(), "8.8.8.8".parse().unwrap(), &[0u8; 12]);
        let (total, src, dst) = read_ipv4(&packet).unwrap();
        assert_eq!(total, 32);
        assert_eq!(src, "10.0.0.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(dst, "8.8.8.8".parse::<Ipv4Addr>().unwrap());

        assert!(matches!(read_ipv4(&packet[..16]), Err(Ipv4Error::TooShort(16))));
        let mut bad_ihl = packet.clone();
        bad_ihl[0] = 0x44;
        assert!(matches!(read_ipv4(&bad_ihl), Err(Ipv4Error::BadHeaderLength(16))));
    }

    #[test]
    fn test_update_rewrites_and_verifies() {
        let mut segment = vec![0u8; 28];
        segment[0..2].copy_from_slice(&4321u16.to_be_bytes());
        segment[2..4].copy_from_slice(&53u16.to_be_bytes());
        segment[4..6].copy_from_slice(&28u16.to_be_bytes());
        let mut packet = build_packet(PROTO_UDP, "10.0.0.5".parse().unwrap(), "8.8.8.8".parse().unwrap(), &segment);

        let masqueraded: Ipv4Addr = "10.8.0.42".parse().unwrap();
        update_ipv4(&mut packet, Some(masqueraded), None).unwrap();

        let (_, src, dst) = read_ipv4(&packet).unwrap();
        assert_eq!(src, masqueraded);
        assert_eq!(dst, "8.8.8.8".parse::<Ipv4Addr>().unwrap());
        assert!(header_verifies(&packet));
        assert!(transport_verifies(&packet));
    }

    #[test]
    fn test_update_idempotent() {
        let mut packet = build_packet(PROTO_TCP, "10.0.0.5".parse().unwrap(), "1.1.1.1".parse().unwrap(), &[0u8; 24]);
        let src: Ipv4Addr = "10.8.0.7".parse().unwrap();
        let dst: Ipv4Addr = "1.1.1.1".parse().unwrap();

        update_ipv4(&mut packet, Some(src), Some(dst)).unwrap();
        let once = packet.clone();
        update_ipv4(&mut packet, Some(src), Some(dst)).unwrap();
        assert_eq!(packet, once);
        assert!(header_verifies(&packet));
        assert!(transport_verifies(&packet));
    }

    #[test]
    fn test_icmp_checksum() {
        let mut segment = vec![0u8; 12];
        segment[0] = 8;
        let mut packet = build_packet(PROTO_ICMP, "10.0.0.5".parse().unwrap(), "8.8.4.4".parse().unwrap(), &segment);
        update_ipv4(&mut packet, None, Some("9.9.9.9".parse().unwrap())).unwrap();

        let total = packet.len();
        assert!(verifies(sum_bytes(0, &packet[MIN_HEADER_LEN..total])));
        assert!(header_verifies(&packet));
    }

    #[test]
    fn test_udp_zero_checksum_becomes_ffff() {
        let mut segment = vec![0u8; 16];
        segment[4..6].copy_from_slice(&16u16.to_be_bytes());
        let mut packet = build_packet(PROTO_UDP, "10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), &segment);

        update_ipv4(&mut packet, None, None).unwrap();
        let first = u16::from_be_bytes([packet[26], packet[27]]);

        // Adding the previous checksum value as a payload word drives the
        // one's-complement sum to exactly 0xFFFF, so the recomputed checksum
        // is zero and the UDP substitution rule kicks in.
        packet[28..30].copy_from_slice(&first.to_be_bytes());
        update_ipv4(&mut packet, None, None).unwrap();
        assert_eq!(u16::from_be_bytes([packet[26], packet[27]]), 0xFFFF);
    }

    #[test]
    fn test_unsupported_protocol() {
        let mut packet = build_packet(47, "10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), &[0u8; 8]);
        assert!(matches!(update_ipv4(&mut packet, None, None), Err(Ipv4Error::UnsupportedProtocol(47))));
    }
}
