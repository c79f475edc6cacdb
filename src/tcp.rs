//! TCP header parsing and emission.
//!
//! Options are skipped on parse (opaque, ignored) and never emitted: this
//! design carries no TCP options beyond the implicit MSS behavior described
//! in the flow layer.

use std::net::Ipv4Addr;

use crate::checksum;
use crate::error::ParseError;

pub const MIN_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    fn from_byte(byte: u8) -> Self {
        Self {
            fin: byte & 0x01 != 0,
            syn: byte & 0x02 != 0,
            rst: byte & 0x04 != 0,
            psh: byte & 0x08 != 0,
            ack: byte & 0x10 != 0,
            urg: byte & 0x20 != 0,
        }
    }

    fn to_byte(self) -> u8 {
        let mut byte = 0u8;
        if self.fin {
            byte |= 0x01;
        }
        if self.syn {
            byte |= 0x02;
        }
        if self.rst {
            byte |= 0x04;
        }
        if self.psh {
            byte |= 0x08;
        }
        if self.ack {
            byte |= 0x10;
        }
        if self.urg {
            byte |= 0x20;
        }
        byte
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    pub header: TcpHeader,
    pub payload: &'a [u8],
}

/// Parses a TCP segment starting at the IP payload. Options (if any, per
/// `data_offset`) are skipped; `payload` is everything after the declared
/// header length.
pub fn parse(input: &[u8]) -> Result<TcpSegment<'_>, ParseError> {
    if input.len() < MIN_HEADER_LEN {
        return Err(ParseError::TruncatedTcpSegment);
    }
    let data_offset = input[12] >> 4;
    let header_len = data_offset as usize * 4;
    if header_len < MIN_HEADER_LEN || input.len() < header_len {
        return Err(ParseError::TruncatedTcpSegment);
    }

    let header = TcpHeader {
        src_port: u16::from_be_bytes([input[0], input[1]]),
        dst_port: u16::from_be_bytes([input[2], input[3]]),
        seq: u32::from_be_bytes([input[4], input[5], input[6], input[7]]),
        ack: u32::from_be_bytes([input[8], input[9], input[10], input[11]]),
        data_offset,
        flags: TcpFlags::from_byte(input[13] & 0x3F),
        window: u16::from_be_bytes([input[14], input[15]]),
        checksum: u16::from_be_bytes([input[16], input[17]]),
        urgent_ptr: u16::from_be_bytes([input[18], input[19]]),
    };

    Ok(TcpSegment {
        header,
        payload: &input[header_len..],
    })
}

/// Builds a complete TCP segment (20-byte header, no options) with the
/// checksum computed over the pseudo-header + header + payload, checksum
/// field zeroed during the sum.
#[allow(clippy::too_many_arguments)]
pub fn emit(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MIN_HEADER_LEN + payload.len());
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&ack.to_be_bytes());
    buf.push(5 << 4); // data_offset = 5 words, no options
    buf.push(flags.to_byte());
    buf.extend_from_slice(&window.to_be_bytes());
    buf.extend_from_slice(&[0, 0]); // checksum placeholder
    buf.extend_from_slice(&[0, 0]); // urgent pointer
    buf.extend_from_slice(payload);

    let c = checksum::tcp_ipv4(src_ip, dst_ip, &buf);
    buf[16..18].copy_from_slice(&c.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_header_fields_and_payload() {
        let flags = TcpFlags {
            syn: true,
            ack: true,
            ..Default::default()
        };
        let seg = emit(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            80,
            40000,
            0x1000_0000,
            0x2000_0000,
            flags,
            65535,
            b"payload",
        );
        let parsed = parse(&seg).unwrap();
        assert_eq!(parsed.header.src_port, 80);
        assert_eq!(parsed.header.dst_port, 40000);
        assert_eq!(parsed.header.seq, 0x1000_0000);
        assert_eq!(parsed.header.ack, 0x2000_0000);
        assert_eq!(parsed.header.flags, flags);
        assert_eq!(parsed.payload, b"payload");
    }

    #[test]
    fn flags_byte_round_trips() {
        let all = TcpFlags {
            fin: true,
            syn: true,
            rst: true,
            psh: true,
            ack: true,
            urg: true,
        };
        assert_eq!(TcpFlags::from_byte(all.to_byte()), all);
    }

    #[test]
    fn rejects_truncated_segment() {
        assert_eq!(parse(&[0u8; 10]), Err(ParseError::TruncatedTcpSegment));
    }
}
