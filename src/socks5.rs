//! RFC 1928 SOCKS5 client: greeting, CONNECT, UDP ASSOCIATE, and the UDP
//! encapsulation framing used once an association is live.
//!
//! Grounded on the same handshake shape as a SOCKS5 UDP-associate helper
//! elsewhere in this corpus, generalized here to also cover CONNECT and to
//! restrict addressing to IPv4 (this design's only supported family).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::error::{FlowError, ProtocolError, SocksReplyCode};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

/// SOCKS5 handshake timeout (§4.5: "CONNECT and ASSOCIATE handshakes
/// complete within 5 s or fail").
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

async fn greet(stream: &mut TcpStream) -> Result<(), FlowError> {
    stream.write_all(&[VERSION, 0x01, METHOD_NO_AUTH]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VERSION {
        return Err(ProtocolError::BadVersion(reply[0]).into());
    }
    if reply[1] != METHOD_NO_AUTH {
        return Err(ProtocolError::NoAcceptableMethod.into());
    }
    Ok(())
}

async fn send_request(stream: &mut TcpStream, cmd: u8, dst: SocketAddrV4) -> Result<(), FlowError> {
    let mut req = Vec::with_capacity(10);
    req.extend_from_slice(&[VERSION, cmd, 0x00, ATYP_IPV4]);
    req.extend_from_slice(&dst.ip().octets());
    req.extend_from_slice(&dst.port().to_be_bytes());
    stream.write_all(&req).await?;
    Ok(())
}

/// Reads a SOCKS5 reply `{VER, REP, RSV, ATYP, BND.ADDR, BND.PORT}` and
/// returns the bound address on success.
async fn read_reply(stream: &mut TcpStream) -> Result<SocketAddr, FlowError> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(ProtocolError::BadVersion(head[0]).into());
    }
    if head[1] != 0x00 {
        let code = SocksReplyCode::from_byte(head[1]);
        return Err(FlowError::SocksRejected(code));
    }
    match head[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(addr),
                u16::from_be_bytes(port),
            )))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut discard = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut discard).await?;
            // Domain replies have no fixed IPv4 representation; this design
            // only targets IPv4 peers, so treat it as unsupported.
            Err(ProtocolError::UnsupportedAtyp(ATYP_DOMAIN).into())
        }
        other => Err(ProtocolError::UnsupportedAtyp(other).into()),
    }
}

/// Performs the greeting and a CONNECT request against `proxy`, returning
/// the established TCP byte-stream to `dst` on success.
pub async fn connect(proxy: SocketAddr, dst: SocketAddrV4) -> Result<TcpStream, FlowError> {
    timeout(HANDSHAKE_TIMEOUT, async move {
        let mut stream = TcpStream::connect(proxy).await?;
        greet(&mut stream).await?;
        send_request(&mut stream, CMD_CONNECT, dst).await?;
        read_reply(&mut stream).await?;
        Ok(stream)
    })
    .await
    .map_err(|_| FlowError::Timeout)?
}

/// A live UDP ASSOCIATE session: the control TCP socket must be kept open
/// for the association's lifetime (closing it terminates the relay
/// server-side), and `socket` is bound to the negotiated relay endpoint.
pub struct UdpAssociation {
    _control: TcpStream,
    socket: UdpSocket,
    relay: SocketAddr,
}

impl UdpAssociation {
    /// Performs the greeting and a UDP ASSOCIATE request against `proxy`,
    /// then binds a local UDP socket for relaying.
    pub async fn establish(proxy: SocketAddr) -> Result<Self, FlowError> {
        timeout(HANDSHAKE_TIMEOUT, async move {
            let mut control = TcpStream::connect(proxy).await?;
            greet(&mut control).await?;
            let unspecified = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
            send_request(&mut control, CMD_UDP_ASSOCIATE, unspecified).await?;
            let relay = read_reply(&mut control).await?;
            let bind_addr = if relay.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind_addr).await?;
            Ok(Self {
                _control: control,
                socket,
                relay,
            })
        })
        .await
        .map_err(|_| FlowError::Timeout)?
    }

    /// Encapsulates `payload` for `target` and sends it to the relay.
    pub async fn send_to(&self, payload: &[u8], target: SocketAddrV4) -> std::io::Result<usize> {
        let framed = encode_udp_packet(target, payload);
        self.socket.send_to(&framed, self.relay).await
    }

    /// Receives one relay datagram, strips the encapsulation header, and
    /// copies the payload to the front of `buf`. Returns the payload length
    /// and the original sender (per the relay's `DST.ADDR`/`DST.PORT`, which
    /// is actually the *source* the relay observed).
    pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let mut raw = vec![0u8; buf.len() + 262];
        let (n, _from) = self.socket.recv_from(&mut raw).await?;
        match decode_udp_header(&raw[..n]) {
            Ok((origin, offset)) => {
                let payload_len = n - offset;
                let payload_len = payload_len.min(buf.len());
                buf[..payload_len].copy_from_slice(&raw[offset..offset + payload_len]);
                Ok((payload_len, origin))
            }
            Err(_) => Ok((0, SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))),
        }
    }
}

/// Builds the `{RSV=0, FRAG=0, ATYP, DST.ADDR, DST.PORT}` + payload
/// encapsulation for a datagram bound for `target`.
pub fn encode_udp_packet(target: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + payload.len());
    buf.extend_from_slice(&[0x00, 0x00, 0x00, ATYP_IPV4]);
    buf.extend_from_slice(&target.ip().octets());
    buf.extend_from_slice(&target.port().to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Parses the encapsulation header from a relay datagram, returning the
/// origin address and the byte offset at which the payload begins.
/// `FRAG != 0` is rejected (dropped, per §4.5).
pub fn decode_udp_header(packet: &[u8]) -> Result<(SocketAddr, usize), ProtocolError> {
    if packet.len() < 4 {
        return Err(ProtocolError::MalformedDns);
    }
    if packet[2] != 0 {
        return Err(ProtocolError::Fragmented);
    }
    match packet[3] {
        ATYP_IPV4 => {
            if packet.len() < 10 {
                return Err(ProtocolError::MalformedDns);
            }
            let addr = Ipv4Addr::new(packet[4], packet[5], packet[6], packet[7]);
            let port = u16::from_be_bytes([packet[8], packet[9]]);
            Ok((SocketAddr::V4(SocketAddrV4::new(addr, port)), 10))
        }
        other => Err(ProtocolError::UnsupportedAtyp(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_recovers_origin_and_payload_offset() {
        let target = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
        let framed = encode_udp_packet(target, b"query");
        let (origin, offset) = decode_udp_header(&framed).unwrap();
        assert_eq!(origin, SocketAddr::V4(target));
        assert_eq!(&framed[offset..], b"query");
    }

    #[test]
    fn rejects_nonzero_frag() {
        let mut framed = encode_udp_packet(SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 1), b"x");
        framed[2] = 1;
        assert!(matches!(decode_udp_header(&framed), Err(ProtocolError::Fragmented)));
    }

    #[test]
    fn reply_code_mapping_matches_rfc_1928() {
        assert_eq!(SocksReplyCode::from_byte(0x05), SocksReplyCode::ConnectionRefused);
        assert_eq!(SocksReplyCode::from_byte(0x07), SocksReplyCode::CommandNotSupported);
    }
}
