//! The TUN device is an external collaborator (§6): the router only depends
//! on a pair of byte streams, never a concrete device. Generalizes the
//! teacher's `Device`/`RxToken`/`TxToken` split (`device/mod.rs`) from a
//! smoltcp virtual interface into a thin wrapper over any
//! `AsyncRead`/`AsyncWrite`, matching how a real TUN file descriptor works:
//! one `read()` yields exactly one IPv4 packet, one `write()` accepts one.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted packet size (§5 resource caps); anything larger is
/// dropped before parsing.
pub const MAX_PACKET_SIZE: usize = 32 * 1024;

/// Wraps the TUN ingress stream. Sole reader for the router's lifetime.
pub struct TunReader<R> {
    inner: R,
    mtu: usize,
}

impl<R: AsyncRead + Unpin> TunReader<R> {
    pub fn new(inner: R, mtu: usize) -> Self {
        Self { inner, mtu }
    }

    /// Reads exactly one packet. A zero-length read means the device is
    /// closed (terminal, triggers router shutdown per §9).
    pub async fn read_packet(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.mtu.max(MAX_PACKET_SIZE)];
        let n = self.inner.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "tun closed"));
        }
        buf.truncate(n);
        Ok(buf)
    }
}

/// Wraps the TUN egress stream. Sole writer for the router's lifetime; all
/// flows enqueue outbound packets through it rather than writing directly.
pub struct TunWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> TunWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_packet(&mut self, packet: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(packet).await
    }
}

/// An in-memory TUN pair backed by a duplex pipe, used by router and flow
/// tests in place of a real device.
#[cfg(test)]
pub mod mock {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    pub fn pair(capacity: usize) -> (TunReader<ReadHalf<DuplexStream>>, TunWriter<WriteHalf<DuplexStream>>, DuplexStream) {
        let (router_side, test_side) = tokio::io::duplex(capacity);
        let (read_half, write_half) = tokio::io::split(router_side);
        (TunReader::new(read_half, capacity), TunWriter::new(write_half), test_side)
    }
}
