//! IPv4 header parsing and emission.
//!
//! Parsing rejects anything shorter than a minimal header, non-v4 versions,
//! undersized IHL, truncated total_length, bad header checksums, and
//! fragmented packets. Emission always stamps `ttl=64`, `flags=DF`,
//! `fragoffset=0`, and computes the header checksum last.

use std::net::Ipv4Addr;

use crate::checksum;
use crate::error::ParseError;

pub const MIN_HEADER_LEN: usize = 20;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Parsed IPv4 header plus the slice of payload bytes that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    pub ihl: u8,
    pub dscp_ecn: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags_fragoffset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    fn more_fragments(&self) -> bool {
        self.flags_fragoffset & 0x2000 != 0
    }

    fn fragment_offset(&self) -> u16 {
        self.flags_fragoffset & 0x1FFF
    }
}

/// A parsed packet: header plus payload (the IP payload, e.g. full TCP/UDP
/// segment including its own header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet<'a> {
    pub header: Ipv4Header,
    pub payload: &'a [u8],
}

/// Parses and validates an IPv4 packet per the invariants in the data model:
/// `ihl >= 5`, `total_length >= ihl*4`, input long enough to hold
/// `total_length`, and a correctly-stamped header checksum. Fragmented
/// packets (MF set or nonzero fragment offset) are rejected; fragment
/// reassembly is out of scope.
pub fn parse(input: &[u8]) -> Result<Ipv4Packet<'_>, ParseError> {
    if input.len() < MIN_HEADER_LEN {
        return Err(ParseError::TooShort);
    }
    let version = input[0] >> 4;
    if version != 4 {
        return Err(ParseError::UnsupportedVersion(version));
    }
    let ihl = input[0] & 0x0F;
    if ihl < 5 {
        return Err(ParseError::InvalidIhl(ihl));
    }
    let header_len = ihl as usize * 4;
    if input.len() < header_len {
        return Err(ParseError::TooShort);
    }
    let total_length = u16::from_be_bytes([input[2], input[3]]);
    if (total_length as usize) < header_len || total_length as usize > input.len() {
        return Err(ParseError::TruncatedPacket {
            total: total_length,
            actual: input.len(),
        });
    }
    if !checksum::verify(&input[..header_len]) {
        return Err(ParseError::BadHeaderChecksum);
    }

    let header = Ipv4Header {
        version,
        ihl,
        dscp_ecn: input[1],
        total_length,
        identification: u16::from_be_bytes([input[4], input[5]]),
        flags_fragoffset: u16::from_be_bytes([input[6], input[7]]),
        ttl: input[8],
        protocol: input[9],
        checksum: u16::from_be_bytes([input[10], input[11]]),
        src: Ipv4Addr::new(input[12], input[13], input[14], input[15]),
        dst: Ipv4Addr::new(input[16], input[17], input[18], input[19]),
    };

    if header.more_fragments() || header.fragment_offset() != 0 {
        return Err(ParseError::Fragmented);
    }
    if header.protocol != PROTO_TCP && header.protocol != PROTO_UDP {
        return Err(ParseError::UnsupportedProtocol(header.protocol));
    }

    Ok(Ipv4Packet {
        payload: &input[header_len..total_length as usize],
        header,
    })
}

static IDENTIFICATION_COUNTER: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(1);

/// Next rolling `identification` value for emitted packets that don't supply
/// their own (used by the router for synthetic replies/RSTs).
pub fn next_identification() -> u16 {
    IDENTIFICATION_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// Builds a complete IPv4 packet: 20-byte header (no options) followed by
/// `payload`. `ttl=64`, `flags=DF`, `fragoffset=0`; checksum computed last.
pub fn emit(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, identification: u16, payload: &[u8]) -> Vec<u8> {
    let total_length = MIN_HEADER_LEN + payload.len();
    let mut buf = Vec::with_capacity(total_length);
    buf.push(0x45); // version 4, IHL 5
    buf.push(0x00); // DSCP/ECN
    buf.extend_from_slice(&(total_length as u16).to_be_bytes());
    buf.extend_from_slice(&identification.to_be_bytes());
    buf.extend_from_slice(&0x4000u16.to_be_bytes()); // DF, no fragment offset
    buf.push(64); // ttl
    buf.push(protocol);
    buf.extend_from_slice(&[0, 0]); // checksum placeholder
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
    buf.extend_from_slice(payload);

    let c = checksum::compute(&buf[..MIN_HEADER_LEN]);
    buf[10..12].copy_from_slice(&c.to_be_bytes());
    buf
}
