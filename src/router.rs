//! Router: reads TUN frames, dispatches to per-flow tasks, owns the
//! connection table and the eviction loop.
//!
//! Grounded on `bin/standalone.rs`'s `StandaloneState`/`TcpFlowHandle` (a
//! bounded mailbox channel plus an `AbortHandle` per flow, with a dedicated
//! reader task and a writer task draining a channel into the TUN device),
//! generalized here to dial the SOCKS5 proxy directly instead of round-
//! tripping through an FFI host callback.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::error::{FlowError, SocksReplyCode};
use crate::flow::tcp_flow::{self, TcpFlow};
use crate::flow::udp_flow::{self, UdpFlow};
use crate::flow::{
    EVICTION_INTERVAL, MAILBOX_CAPACITY, PER_FLOW_BUFFER, SHUTDOWN_DEADLINE, TCP_IDLE_TIMEOUT,
    UDP_IDLE_TIMEOUT,
};
use crate::ip;
use crate::table::{Activity, ConnectionTable, FlowKey, Protocol, StatsSnapshot};
use crate::tcp;
use crate::tun::{TunReader, TunWriter};
use crate::udp;

/// Process-wide monotonic epoch; per-flow activity is stored as a compact
/// atomic millisecond offset from this point rather than a full `Instant`,
/// so a flow's last-active time can be read by the eviction task without
/// touching the flow task's own state.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn millis_since_epoch() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Construction-time configuration for a `Router` (§6 startup contract).
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub socks5_endpoint: SocketAddr,
    pub dns_resolver: Option<SocketAddrV4>,
    pub mtu: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            socks5_endpoint: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1080)),
            dns_resolver: None,
            mtu: 1500,
        }
    }
}

struct ActivityCell(Arc<AtomicU64>);

impl ActivityCell {
    fn new(now: Instant) -> Self {
        let cell = Self(Arc::new(AtomicU64::new(0)));
        cell.touch(now);
        cell
    }

    fn touch(&self, now: Instant) {
        let millis = now.saturating_duration_since(*EPOCH).as_millis() as u64;
        self.0.store(millis, Ordering::Relaxed);
    }

    fn handle(&self) -> Arc<AtomicU64> {
        self.0.clone()
    }
}

/// Packs a TCP flow's `(snd_nxt, rcv_nxt)` into one atomic, published by the
/// flow's own task so the router can build a correctly-addressed RST if the
/// flow is evicted under capacity pressure (§8 S6) without reaching into the
/// live `TcpFlow` owned by that task.
struct SeqCell(Arc<AtomicU64>);

impl SeqCell {
    fn new(snd_nxt: u32, rcv_nxt: u32) -> Self {
        let cell = Self(Arc::new(AtomicU64::new(0)));
        cell.publish(snd_nxt, rcv_nxt);
        cell
    }

    fn publish(&self, snd_nxt: u32, rcv_nxt: u32) {
        let packed = (snd_nxt as u64) << 32 | rcv_nxt as u64;
        self.0.store(packed, Ordering::Relaxed);
    }

    fn handle(&self) -> Arc<AtomicU64> {
        self.0.clone()
    }
}

fn unpack_seq(cell: &AtomicU64) -> (u32, u32) {
    let packed = cell.load(Ordering::Relaxed);
    ((packed >> 32) as u32, packed as u32)
}

struct TcpFlowHandle {
    mailbox: mpsc::Sender<Vec<u8>>,
    abort: tokio::task::AbortHandle,
    activity: Arc<AtomicU64>,
    seq: Arc<AtomicU64>,
}

impl Activity for TcpFlowHandle {
    fn last_activity(&self) -> Instant {
        *EPOCH + Duration::from_millis(self.activity.load(Ordering::Relaxed))
    }
}

struct UdpFlowHandle {
    mailbox: mpsc::Sender<Vec<u8>>,
    abort: tokio::task::AbortHandle,
    activity: Arc<AtomicU64>,
}

impl Activity for UdpFlowHandle {
    fn last_activity(&self) -> Instant {
        *EPOCH + Duration::from_millis(self.activity.load(Ordering::Relaxed))
    }
}

type Table = ConnectionTable<TcpFlowHandle, UdpFlowHandle>;

/// A handle to a running router: the only way outside code observes or
/// stops it, mirroring the teacher's `BridgeEngine` `start`/`stop`/
/// `copy_stats` surface without the FFI boundary.
#[derive(Clone)]
pub struct RouterHandle {
    table: Arc<Mutex<Table>>,
    shutdown: Arc<Notify>,
    shutdown_requested: Arc<AtomicBool>,
}

impl RouterHandle {
    pub fn stats(&self) -> StatsSnapshot {
        self.table.lock().snapshot_stats()
    }

    /// Idempotent: subsequent calls after the first are no-ops.
    pub fn shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
        }
    }
}

pub struct Router<R, W> {
    tun_reader: TunReader<R>,
    egress_tx: mpsc::Sender<Vec<u8>>,
    egress_task: tokio::task::JoinHandle<()>,
    table: Arc<Mutex<Table>>,
    config: RouterConfig,
    associate_disabled: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    shutdown_requested: Arc<AtomicBool>,
    _writer_marker: std::marker::PhantomData<W>,
}

impl<R, W> Router<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(tun_reader: R, tun_writer: W, config: RouterConfig) -> (Self, RouterHandle) {
        let (egress_tx, mut egress_rx) = mpsc::channel::<Vec<u8>>(8192);
        let mut writer = TunWriter::new(tun_writer);
        let egress_task = tokio::spawn(async move {
            while let Some(packet) = egress_rx.recv().await {
                if let Err(error) = writer.write_packet(&packet).await {
                    warn!(target: "tunwire::router", %error, "tun egress write failed");
                    break;
                }
            }
        });

        let table = Arc::new(Mutex::new(Table::new()));
        let shutdown = Arc::new(Notify::new());
        let shutdown_requested = Arc::new(AtomicBool::new(false));

        let handle = RouterHandle {
            table: table.clone(),
            shutdown: shutdown.clone(),
            shutdown_requested: shutdown_requested.clone(),
        };

        let router = Self {
            tun_reader: TunReader::new(tun_reader, config.mtu),
            egress_tx,
            egress_task,
            table,
            config,
            associate_disabled: Arc::new(AtomicBool::new(false)),
            shutdown,
            shutdown_requested,
            _writer_marker: std::marker::PhantomData,
        };
        (router, handle)
    }

    /// Drives the router until `RouterHandle::shutdown` is called or the
    /// TUN ingress stream returns a terminal error.
    pub async fn run(mut self) {
        let eviction_table = self.table.clone();
        let eviction_shutdown = self.shutdown.clone();
        let eviction_task = tokio::spawn(async move {
            eviction_loop(eviction_table, eviction_shutdown).await;
        });

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(target: "tunwire::router", "shutdown requested");
                    break;
                }
                packet = self.tun_reader.read_packet() => {
                    match packet {
                        Ok(frame) => self.dispatch(frame).await,
                        Err(error) => {
                            warn!(target: "tunwire::router", %error, "terminal tun read error, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        eviction_task.abort();
        let (tcp_flows, udp_flows) = self.table.lock().close_all();
        for (_, handle) in tcp_flows {
            handle.abort.abort();
        }
        for (_, handle) in udp_flows {
            handle.abort.abort();
        }
        drop(self.egress_tx);
        let _ = tokio::time::timeout(SHUTDOWN_DEADLINE, self.egress_task).await;
    }

    async fn dispatch(&mut self, frame: Vec<u8>) {
        let parsed = match ip::parse(&frame) {
            Ok(p) => p,
            Err(error) => {
                debug!(target: "tunwire::router", %error, "dropping malformed ip packet");
                return;
            }
        };

        match parsed.header.protocol {
            ip::PROTO_TCP => self.dispatch_tcp(&parsed.header, parsed.payload).await,
            ip::PROTO_UDP => self.dispatch_udp(&parsed.header, parsed.payload).await,
            _ => {}
        }
    }

    async fn dispatch_tcp(&mut self, header: &ip::Ipv4Header, payload: &[u8]) {
        let seg = match tcp::parse(payload) {
            Ok(seg) => seg,
            Err(error) => {
                debug!(target: "tunwire::router", %error, "dropping malformed tcp segment");
                return;
            }
        };
        let key = FlowKey::new(Protocol::Tcp, header.src, seg.header.src_port, header.dst, seg.header.dst_port);

        let existing = {
            let mut table = self.table.lock();
            if let Some(handle) = table.get_tcp(&key) {
                let _ = handle.mailbox.try_send(payload.to_vec());
                table.touch_tcp(&key);
                true
            } else {
                false
            }
        };
        if existing {
            return;
        }

        if !seg.header.flags.syn {
            if !seg.header.flags.rst {
                let rst = tcp_flow::reset_for_unmatched(&key, &seg);
                let _ = self.egress_tx.send(rst).await;
            }
            return;
        }

        self.spawn_tcp_flow(key, &seg);
    }

    fn spawn_tcp_flow(&mut self, key: FlowKey, syn: &tcp::TcpSegment<'_>) {
        let now = Instant::now();
        let flow = TcpFlow::new_syn_received(key, syn, now);
        let (snd_nxt, rcv_nxt) = flow.seq_state();
        let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let activity = ActivityCell::new(now);
        let activity_handle = activity.handle();
        let seq = SeqCell::new(snd_nxt, rcv_nxt);
        let seq_handle = seq.handle();
        let egress_tx = self.egress_tx.clone();
        let proxy = self.config.socks5_endpoint;
        let table = self.table.clone();

        let join = tokio::spawn(run_tcp_flow(
            flow,
            mailbox_rx,
            egress_tx.clone(),
            proxy,
            activity,
            seq,
            table.clone(),
            key,
        ));

        let mut table = self.table.lock();
        let handle = TcpFlowHandle {
            mailbox: mailbox_tx,
            abort: join.abort_handle(),
            activity: activity_handle,
            seq: seq_handle,
        };
        if let Some((evicted_key, evicted)) = table.insert_tcp(key, handle) {
            let (evicted_snd_nxt, evicted_rcv_nxt) = unpack_seq(&evicted.seq);
            let rst = tcp_flow::reset_for_eviction(&evicted_key, evicted_snd_nxt, evicted_rcv_nxt);
            let _ = egress_tx.try_send(rst);
            evicted.abort.abort();
            debug!(target: "tunwire::router", ?evicted_key, "evicted tcp flow under capacity pressure");
        }
    }

    async fn dispatch_udp(&mut self, header: &ip::Ipv4Header, payload: &[u8]) {
        let datagram = match udp::parse(payload) {
            Ok(d) => d,
            Err(error) => {
                debug!(target: "tunwire::router", %error, "dropping malformed udp datagram");
                return;
            }
        };
        let key = FlowKey::new(
            Protocol::Udp,
            header.src,
            datagram.header.src_port,
            header.dst,
            datagram.header.dst_port,
        );

        if datagram.header.dst_port == udp_flow::DNS_PORT {
            let has_flow = self.table.lock().get_udp(&key).is_some();
            if !has_flow {
                self.spawn_dns_query(key, header.dst, datagram.payload.to_vec());
                return;
            }
        }

        let existing = {
            let mut table = self.table.lock();
            if let Some(handle) = table.get_udp(&key) {
                let _ = handle.mailbox.try_send(datagram.payload.to_vec());
                table.touch_udp(&key);
                true
            } else {
                false
            }
        };
        if existing {
            return;
        }

        if self.associate_disabled.load(Ordering::Relaxed) {
            return;
        }

        self.spawn_udp_flow(key, datagram.payload.to_vec());
    }

    fn spawn_dns_query(&mut self, key: FlowKey, original_dst: Ipv4Addr, query: Vec<u8>) {
        let proxy = self.config.socks5_endpoint;
        let resolver_target = self
            .config
            .dns_resolver
            .unwrap_or_else(|| SocketAddrV4::new(original_dst, udp_flow::DNS_PORT));
        let egress_tx = self.egress_tx.clone();
        tokio::spawn(async move {
            match udp_flow::resolve_over_tcp(proxy, resolver_target, &key, &query).await {
                Ok(packet) => {
                    let _ = egress_tx.send(packet).await;
                }
                Err(error) => {
                    debug!(target: "tunwire::dns", %error, "dns-over-tcp query failed, dropping");
                }
            }
        });
    }

    fn spawn_udp_flow(&mut self, key: FlowKey, first_payload: Vec<u8>) {
        let now = Instant::now();
        let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let activity = ActivityCell::new(now);
        let activity_handle = activity.handle();
        let egress_tx = self.egress_tx.clone();
        let proxy = self.config.socks5_endpoint;
        let associate_disabled = self.associate_disabled.clone();
        let table = self.table.clone();

        let join = tokio::spawn(run_udp_flow(
            key,
            first_payload,
            mailbox_rx,
            egress_tx,
            proxy,
            activity,
            associate_disabled,
            table.clone(),
        ));

        let mut table = self.table.lock();
        let handle = UdpFlowHandle {
            mailbox: mailbox_tx,
            abort: join.abort_handle(),
            activity: activity_handle,
        };
        if let Some((evicted_key, evicted)) = table.insert_udp(key, handle) {
            // UDP has no RST-equivalent teardown signal; the client simply
            // stops getting replies for this 5-tuple, same as if the relay
            // had gone silent.
            evicted.abort.abort();
            debug!(target: "tunwire::router", ?evicted_key, "evicted udp flow under capacity pressure");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_tcp_flow(
    mut flow: TcpFlow,
    mut mailbox: mpsc::Receiver<Vec<u8>>,
    egress_tx: mpsc::Sender<Vec<u8>>,
    proxy: SocketAddr,
    activity: ActivityCell,
    seq: SeqCell,
    table: Arc<Mutex<Table>>,
    key: FlowKey,
) {
    match flow.connect(proxy).await {
        Ok(syn_ack) => {
            let _ = egress_tx.send(syn_ack).await;
        }
        Err((error, rst)) => {
            debug!(target: "tunwire::flow", %error, "tcp connect failed, sending rst");
            let _ = egress_tx.send(rst).await;
            table.lock().remove_tcp(&key);
            return;
        }
    }
    {
        let (snd_nxt, rcv_nxt) = flow.seq_state();
        seq.publish(snd_nxt, rcv_nxt);
    }

    let mut buf = vec![0u8; PER_FLOW_BUFFER];
    loop {
        let upstream_readable = flow.upstream_readable();
        tokio::select! {
            incoming = mailbox.recv() => {
                match incoming {
                    Some(raw) => {
                        let Ok(seg) = tcp::parse(&raw) else { continue };
                        let outcome = flow.handle_client_segment(&seg, Instant::now());

                        let mut write_failed = false;
                        if let Some(payload) = outcome.forward_to_upstream {
                            match flow.upstream_mut() {
                                Some(stream) => {
                                    if stream.write_all(&payload).await.is_err() {
                                        write_failed = true;
                                    } else {
                                        table.lock().stats.record_bytes_in(payload.len() as u64);
                                    }
                                }
                                None => write_failed = true,
                            }
                        }
                        if write_failed {
                            break;
                        }

                        for packet in outcome.emit {
                            let _ = egress_tx.send(packet).await;
                        }
                        if outcome.half_close_upstream {
                            if let Some(stream) = flow.upstream_mut() {
                                let _ = stream.shutdown().await;
                            }
                        }
                        let (snd_nxt, rcv_nxt) = flow.seq_state();
                        seq.publish(snd_nxt, rcv_nxt);
                        activity.touch(Instant::now());
                        if outcome.close || flow.is_terminal() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            result = async {
                match flow.upstream_mut() {
                    Some(stream) => Some(stream.read(&mut buf).await),
                    None => None,
                }
            }, if upstream_readable => {
                match result {
                    Some(Ok(0)) => {
                        let fin = flow.handle_upstream_eof();
                        let _ = egress_tx.send(fin).await;
                        let (snd_nxt, rcv_nxt) = flow.seq_state();
                        seq.publish(snd_nxt, rcv_nxt);
                        activity.touch(Instant::now());
                        if flow.is_terminal() {
                            break;
                        }
                    }
                    Some(Ok(n)) => {
                        table.lock().stats.record_bytes_out(n as u64);
                        for packet in flow.build_data_segments(&buf[..n]) {
                            let _ = egress_tx.send(packet).await;
                        }
                        let (snd_nxt, rcv_nxt) = flow.seq_state();
                        seq.publish(snd_nxt, rcv_nxt);
                        activity.touch(Instant::now());
                    }
                    Some(Err(_)) | None => break,
                }
            }
        }
    }

    flow.mark_closed();
    table.lock().remove_tcp(&key);
}

#[allow(clippy::too_many_arguments)]
async fn run_udp_flow(
    key: FlowKey,
    first_payload: Vec<u8>,
    mut mailbox: mpsc::Receiver<Vec<u8>>,
    egress_tx: mpsc::Sender<Vec<u8>>,
    proxy: SocketAddr,
    activity: ActivityCell,
    associate_disabled: Arc<AtomicBool>,
    table: Arc<Mutex<Table>>,
) {
    let now = Instant::now();
    let mut flow = match UdpFlow::establish(proxy, key, now).await {
        Ok(flow) => flow,
        Err(FlowError::SocksRejected(SocksReplyCode::CommandNotSupported)) => {
            warn!(target: "tunwire::flow", "socks5 server does not support udp associate; disabling");
            associate_disabled.store(true, Ordering::Relaxed);
            table.lock().remove_udp(&key);
            return;
        }
        Err(error) => {
            debug!(target: "tunwire::flow", %error, "udp associate failed");
            table.lock().remove_udp(&key);
            return;
        }
    };

    if flow.send_to_relay(&first_payload, now).await.is_err() {
        table.lock().remove_udp(&key);
        return;
    }
    table.lock().stats.record_bytes_in(first_payload.len() as u64);
    activity.touch(Instant::now());

    loop {
        tokio::select! {
            incoming = mailbox.recv() => {
                match incoming {
                    Some(payload) => {
                        if flow.send_to_relay(&payload, Instant::now()).await.is_err() {
                            break;
                        }
                        table.lock().stats.record_bytes_in(payload.len() as u64);
                        activity.touch(Instant::now());
                    }
                    None => break,
                }
            }
            result = async {
                let before = flow.bytes_in;
                flow.recv_from_relay().await.map(|packet| (packet, flow.bytes_in - before))
            } => {
                match result {
                    Ok((packet, received)) => {
                        table.lock().stats.record_bytes_out(received);
                        let _ = egress_tx.send(packet).await;
                        activity.touch(Instant::now());
                    }
                    Err(_) => break,
                }
            }
        }
    }

    table.lock().remove_udp(&key);
}

async fn eviction_loop(table: Arc<Mutex<Table>>, shutdown: Arc<Notify>) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = tokio::time::sleep(EVICTION_INTERVAL) => {
                let now = Instant::now();
                let (tcp_evicted, udp_evicted) = table.lock().evict_idle(now, TCP_IDLE_TIMEOUT, UDP_IDLE_TIMEOUT);
                for (key, handle) in tcp_evicted {
                    debug!(target: "tunwire::router", ?key, "evicting idle tcp flow");
                    handle.abort.abort();
                }
                for (key, handle) in udp_evicted {
                    debug!(target: "tunwire::router", ?key, "evicting idle udp flow");
                    handle.abort.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;

    use crate::tcp::TcpFlags;

    const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);

    fn build_syn(src_port: u16, dst_port: u16, seq: u32) -> Vec<u8> {
        let segment = tcp::emit(
            CLIENT_IP,
            SERVER_IP,
            src_port,
            dst_port,
            seq,
            0,
            TcpFlags { syn: true, ..Default::default() },
            65535,
            &[],
        );
        ip::emit(CLIENT_IP, SERVER_IP, ip::PROTO_TCP, 1, &segment)
    }

    fn build_data(src_port: u16, dst_port: u16, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
        let segment = tcp::emit(
            CLIENT_IP,
            SERVER_IP,
            src_port,
            dst_port,
            seq,
            ack,
            TcpFlags { ack: true, psh: true, ..Default::default() },
            65535,
            payload,
        );
        ip::emit(CLIENT_IP, SERVER_IP, ip::PROTO_TCP, 2, &segment)
    }

    /// Reassembles whatever the egress writer puts onto the duplex pipe back
    /// into discrete IP packets: `tokio::io::duplex` is a byte stream, not a
    /// message channel, so a single `read()` may return a partial packet or
    /// several packets concatenated.
    struct PacketReader<'a> {
        stream: &'a mut DuplexStream,
        buf: Vec<u8>,
    }

    impl<'a> PacketReader<'a> {
        fn new(stream: &'a mut DuplexStream) -> Self {
            Self { stream, buf: Vec::new() }
        }

        async fn next_packet(&mut self) -> Vec<u8> {
            loop {
                if self.buf.len() >= ip::MIN_HEADER_LEN {
                    let total_length = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
                    if self.buf.len() >= total_length {
                        return self.buf.drain(..total_length).collect();
                    }
                }
                let mut chunk = [0u8; 4096];
                let n = tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut chunk))
                    .await
                    .expect("packet within timeout")
                    .unwrap();
                assert!(n > 0, "tun egress stream closed unexpectedly");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    /// A minimal SOCKS5 server: accepts the greeting, then either refuses
    /// every CONNECT with `REP=0x05` (connection refused) or accepts and
    /// echoes bytes back, depending on `refuse`.
    async fn spawn_mock_socks5(refuse: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut greeting = [0u8; 3];
                    if stream.read_exact(&mut greeting).await.is_err() {
                        return;
                    }
                    if stream.write_all(&[0x05, 0x00]).await.is_err() {
                        return;
                    }
                    let mut head = [0u8; 4];
                    if stream.read_exact(&mut head).await.is_err() {
                        return;
                    }
                    let mut addr_buf = [0u8; 4];
                    if stream.read_exact(&mut addr_buf).await.is_err() {
                        return;
                    }
                    let mut port_buf = [0u8; 2];
                    if stream.read_exact(&mut port_buf).await.is_err() {
                        return;
                    }

                    if refuse {
                        let _ = stream.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await;
                        return;
                    }
                    if stream.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.is_err() {
                        return;
                    }

                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn refused_connect_yields_single_rst() {
        let proxy = spawn_mock_socks5(true).await;
        let (router_side, mut test_side) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(router_side);
        let config = RouterConfig { socks5_endpoint: proxy, dns_resolver: None, mtu: 1500 };
        let (router, handle) = Router::new(reader, writer, config);
        let run = tokio::spawn(router.run());

        test_side.write_all(&build_syn(40000, 80, 0x1000_0000)).await.unwrap();

        let mut packets = PacketReader::new(&mut test_side);
        let packet = packets.next_packet().await;
        let pkt = ip::parse(&packet).unwrap();
        let seg = tcp::parse(pkt.payload).unwrap();
        assert!(seg.header.flags.rst);
        assert_eq!(pkt.header.src, SERVER_IP);
        assert_eq!(pkt.header.dst, CLIENT_IP);

        handle.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(2), run).await;
    }

    #[tokio::test]
    async fn successful_connect_bridges_client_bytes_to_echo_server() {
        let proxy = spawn_mock_socks5(false).await;
        let (router_side, mut test_side) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(router_side);
        let config = RouterConfig { socks5_endpoint: proxy, dns_resolver: None, mtu: 1500 };
        let (router, handle) = Router::new(reader, writer, config);
        let run = tokio::spawn(router.run());

        let client_iss = 0x2000_0000u32;
        test_side.write_all(&build_syn(41000, 80, client_iss)).await.unwrap();

        let mut packets = PacketReader::new(&mut test_side);

        let syn_ack_packet = packets.next_packet().await;
        let pkt = ip::parse(&syn_ack_packet).unwrap();
        let syn_ack = tcp::parse(pkt.payload).unwrap();
        assert!(syn_ack.header.flags.syn && syn_ack.header.flags.ack);
        assert_eq!(syn_ack.header.ack, client_iss.wrapping_add(1));
        let server_iss = syn_ack.header.seq;

        let data = build_data(41000, 80, client_iss.wrapping_add(1), server_iss.wrapping_add(1), b"hello");
        test_side.write_all(&data).await.unwrap();

        let ack_packet = packets.next_packet().await;
        let pkt = ip::parse(&ack_packet).unwrap();
        let ack = tcp::parse(pkt.payload).unwrap();
        assert!(ack.header.flags.ack);
        assert!(ack.payload.is_empty());

        let echo_packet = packets.next_packet().await;
        let pkt = ip::parse(&echo_packet).unwrap();
        let echoed = tcp::parse(pkt.payload).unwrap();
        assert_eq!(echoed.payload, b"hello");

        handle.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(2), run).await;
    }
}
