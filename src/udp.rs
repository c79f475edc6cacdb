//! UDP datagram parsing and emission.

use std::net::Ipv4Addr;

use crate::checksum;
use crate::error::ParseError;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub header: UdpHeader,
    pub payload: &'a [u8],
}

/// Parses a UDP datagram: `length` must be at least 8 and must not exceed
/// the available buffer.
pub fn parse(input: &[u8]) -> Result<UdpDatagram<'_>, ParseError> {
    if input.len() < HEADER_LEN {
        return Err(ParseError::UdpTooShort(input.len() as u16));
    }
    let length = u16::from_be_bytes([input[4], input[5]]);
    if length < HEADER_LEN as u16 {
        return Err(ParseError::UdpTooShort(length));
    }
    if (length as usize) > input.len() {
        return Err(ParseError::UdpTruncated {
            declared: length,
            actual: input.len(),
        });
    }
    let header = UdpHeader {
        src_port: u16::from_be_bytes([input[0], input[1]]),
        dst_port: u16::from_be_bytes([input[2], input[3]]),
        length,
        checksum: u16::from_be_bytes([input[6], input[7]]),
    };
    Ok(UdpDatagram {
        payload: &input[HEADER_LEN..length as usize],
        header,
    })
}

/// Builds a complete UDP datagram. The checksum is always computed; per
/// RFC 768 a computed value of exactly zero is transmitted as `0xFFFF`.
pub fn emit(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_LEN + payload.len()) as u16;
    let mut buf = Vec::with_capacity(length as usize);
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(&[0, 0]); // checksum placeholder
    buf.extend_from_slice(payload);

    let mut c = checksum::udp_ipv4(src_ip, dst_ip, &buf);
    if c == 0 {
        c = 0xFFFF;
    }
    buf[6..8].copy_from_slice(&c.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_fields_and_payload() {
        let src = Ipv4Addr::new(8, 8, 8, 8);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let datagram = emit(src, dst, 53, 40000, b"dns payload");
        let parsed = parse(&datagram).unwrap();
        assert_eq!(parsed.header.src_port, 53);
        assert_eq!(parsed.header.dst_port, 40000);
        assert_eq!(parsed.header.length as usize, HEADER_LEN + 11);
        assert_eq!(parsed.payload, b"dns payload");
    }

    #[test]
    fn rejects_short_length_field() {
        let mut buf = vec![0u8; 8];
        buf[5] = 4; // length=4 < 8
        assert_eq!(parse(&buf), Err(ParseError::UdpTooShort(4)));
    }

    #[test]
    fn rejects_truncated_buffer() {
        let mut buf = vec![0u8; 8];
        buf[4..6].copy_from_slice(&100u16.to_be_bytes());
        assert_eq!(
            parse(&buf),
            Err(ParseError::UdpTruncated {
                declared: 100,
                actual: 8
            })
        );
    }

    #[test]
    fn zero_checksum_is_transmitted_as_all_ones() {
        let src = Ipv4Addr::new(0, 0, 0, 0);
        let dst = Ipv4Addr::new(0, 0, 0, 0);
        let datagram = emit(src, dst, 0, 0, &[]);
        assert_ne!(u16::from_be_bytes([datagram[6], datagram[7]]), 0);
    }
}
