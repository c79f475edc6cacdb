//! Error taxonomy shared by codecs, the SOCKS5 client, and flows.
//!
//! Mirrors the teacher's use of `thiserror` for typed, non-`anyhow` errors at
//! library boundaries (`dns::ResolveError`).

use thiserror::Error;

/// Malformed IP/TCP/UDP header. Always logged and dropped, never surfaced
/// past the router's dispatch point.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("packet shorter than minimum header size")]
    TooShort,
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),
    #[error("IHL {0} below minimum of 5 words")]
    InvalidIhl(u8),
    #[error("total_length {total} exceeds buffer length {actual}")]
    TruncatedPacket { total: u16, actual: usize },
    #[error("IPv4 header checksum mismatch")]
    BadHeaderChecksum,
    #[error("packet is fragmented (MF set or nonzero offset)")]
    Fragmented,
    #[error("unsupported IP protocol {0}")]
    UnsupportedProtocol(u8),
    #[error("TCP segment shorter than its data offset")]
    TruncatedTcpSegment,
    #[error("UDP datagram length {0} below minimum of 8")]
    UdpTooShort(u16),
    #[error("UDP datagram length {declared} does not fit buffer of {actual} bytes")]
    UdpTruncated { declared: u16, actual: usize },
    #[error("packet exceeds maximum size of {max} bytes")]
    Oversize { max: usize },
}

/// Malformed SOCKS5 server reply. Fails only the flow performing the
/// handshake.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected SOCKS5 version byte {0:#x}")]
    BadVersion(u8),
    #[error("SOCKS5 server rejected method negotiation")]
    NoAcceptableMethod,
    #[error("SOCKS5 reply address type {0:#x} not supported")]
    UnsupportedAtyp(u8),
    #[error("SOCKS5 UDP encapsulation header had nonzero FRAG field")]
    Fragmented,
    #[error("malformed DNS response")]
    MalformedDns,
    #[error("SOCKS5 server refused the request: {0:?}")]
    Rejected(SocksReplyCode),
}

/// The `REP` byte of a SOCKS5 reply, per RFC 1928 §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksReplyCode {
    GeneralFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Other(u8),
}

impl SocksReplyCode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::GeneralFailure,
            0x02 => Self::NotAllowed,
            0x03 => Self::NetworkUnreachable,
            0x04 => Self::HostUnreachable,
            0x05 => Self::ConnectionRefused,
            0x06 => Self::TtlExpired,
            0x07 => Self::CommandNotSupported,
            0x08 => Self::AddressTypeNotSupported,
            other => Self::Other(other),
        }
    }
}

/// Top-level error for a single flow's lifetime: I/O, protocol, timeout, or
/// capacity-eviction causes. The router translates these into protocol
/// actions (RST, drop, teardown) without unwinding its own task.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("socks5 protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("socks5 server rejected the request: {0:?}")]
    SocksRejected(SocksReplyCode),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("flow evicted under capacity pressure")]
    CapacityExceeded,
}
