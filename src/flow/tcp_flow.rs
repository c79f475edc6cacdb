//! Per-connection TCP state machine: a simplified RFC 793 terminator that
//! bridges the client's TCP stream to a SOCKS5 CONNECT session.
//!
//! Grounded on the teacher's `handle_tcp_packet`/`finalize_closed_flows`
//! (`flow_manager/mod.rs`) for the admit-dial-bridge-teardown shape, and
//! `flow_manager/transport.rs` for MSS chunking, reimplemented around
//! explicit `seq`/`ack` bookkeeping instead of a smoltcp `TcpSocket`.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Instant;

use rand::RngCore;
use tokio::net::TcpStream;

use crate::error::FlowError;
use crate::flow::{seq_lt, MSS, RCV_WND};
use crate::ip;
use crate::socks5;
use crate::table::{Activity, FlowKey};
use crate::tcp::{self, TcpFlags, TcpSegment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynReceived,
    Connecting,
    Established,
    FinWait,
    Closed,
}

/// Packets to emit to TUN and/or bytes to forward upstream as the result of
/// handling one inbound client segment.
#[derive(Default)]
pub struct ClientSegmentOutcome {
    pub emit: Vec<Vec<u8>>,
    pub forward_to_upstream: Option<Vec<u8>>,
    pub half_close_upstream: bool,
    pub close: bool,
}

pub struct TcpFlow {
    pub key: FlowKey,
    pub state: TcpState,
    upstream: Option<TcpStream>,
    our_iss: u32,
    peer_iss: u32,
    snd_nxt: u32,
    rcv_nxt: u32,
    rcv_wnd: u16,
    created_at: Instant,
    last_activity_at: Instant,
    pub bytes_in: u64,
    pub bytes_out: u64,
    client_fin_seen: bool,
    upstream_eof_seen: bool,
}

impl Activity for TcpFlow {
    fn last_activity(&self) -> Instant {
        self.last_activity_at
    }
}

impl TcpFlow {
    /// A SYN with no existing table entry creates a flow in `SynReceived`:
    /// `our_iss` is drawn from the process PRNG, `peer_iss` is the client's
    /// SYN sequence, and `rcv_nxt` starts one past it.
    pub fn new_syn_received(key: FlowKey, syn: &TcpSegment<'_>, now: Instant) -> Self {
        let our_iss = rand::thread_rng().next_u32();
        let peer_iss = syn.header.seq;
        Self {
            key,
            state: TcpState::SynReceived,
            upstream: None,
            our_iss,
            peer_iss,
            snd_nxt: our_iss,
            rcv_nxt: peer_iss.wrapping_add(1),
            rcv_wnd: RCV_WND,
            created_at: now,
            last_activity_at: now,
            bytes_in: 0,
            bytes_out: 0,
            client_fin_seen: false,
            upstream_eof_seen: false,
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn server_ip(&self) -> Ipv4Addr {
        self.key.dst_ip
    }

    fn client_ip(&self) -> Ipv4Addr {
        self.key.src_ip
    }

    fn emit_segment(&self, flags: TcpFlags, seq: u32, payload: &[u8]) -> Vec<u8> {
        let segment = tcp::emit(
            self.server_ip(),
            self.client_ip(),
            self.key.dst_port,
            self.key.src_port,
            seq,
            self.rcv_nxt,
            flags,
            self.rcv_wnd,
            payload,
        );
        ip::emit(
            self.server_ip(),
            self.client_ip(),
            ip::PROTO_TCP,
            ip::next_identification(),
            &segment,
        )
    }

    /// Performs the SOCKS5 CONNECT handshake. On success, transitions to
    /// `Established` and returns the SYN-ACK to emit. On failure,
    /// transitions to `Closed` and returns the RST to emit.
    pub async fn connect(&mut self, proxy: SocketAddr) -> Result<Vec<u8>, (FlowError, Vec<u8>)> {
        self.state = TcpState::Connecting;
        let dst = SocketAddrV4::new(self.key.dst_ip, self.key.dst_port);
        match socks5::connect(proxy, dst).await {
            Ok(stream) => {
                self.upstream = Some(stream);
                self.state = TcpState::Established;
                self.snd_nxt = self.our_iss.wrapping_add(1);
                let flags = TcpFlags {
                    syn: true,
                    ack: true,
                    ..Default::default()
                };
                Ok(self.emit_segment(flags, self.our_iss, &[]))
            }
            Err(err) => {
                self.state = TcpState::Closed;
                let flags = TcpFlags {
                    rst: true,
                    ack: true,
                    ..Default::default()
                };
                let rst = self.emit_segment(flags, 0, &[]);
                Err((err, rst))
            }
        }
    }

    pub fn upstream_mut(&mut self) -> Option<&mut TcpStream> {
        self.upstream.as_mut()
    }

    /// Current `(snd_nxt, rcv_nxt)`, published to the router so it can build
    /// a RST addressed correctly if this flow is evicted under capacity
    /// pressure (§8 S6) without reaching into the flow's own task.
    pub fn seq_state(&self) -> (u32, u32) {
        (self.snd_nxt, self.rcv_nxt)
    }

    pub fn is_established(&self) -> bool {
        self.state == TcpState::Established
    }

    /// Upstream reads continue through `FinWait`: the client's FIN only
    /// half-closes our write side, not the read side.
    pub fn upstream_readable(&self) -> bool {
        matches!(self.state, TcpState::Established | TcpState::FinWait)
    }

    pub fn is_terminal(&self) -> bool {
        self.state == TcpState::Closed || (self.client_fin_seen && self.upstream_eof_seen)
    }

    fn build_ack(&self) -> Vec<u8> {
        self.emit_segment(TcpFlags { ack: true, ..Default::default() }, self.snd_nxt, &[])
    }

    fn build_fin_ack(&mut self) -> Vec<u8> {
        let seq = self.snd_nxt;
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.emit_segment(
            TcpFlags {
                fin: true,
                ack: true,
                ..Default::default()
            },
            seq,
            &[],
        )
    }

    /// Handles one inbound client segment per the state table in §4.7.
    pub fn handle_client_segment(&mut self, seg: &TcpSegment<'_>, now: Instant) -> ClientSegmentOutcome {
        self.last_activity_at = now;
        let mut outcome = ClientSegmentOutcome::default();

        if seg.header.flags.rst {
            self.state = TcpState::Closed;
            outcome.close = true;
            return outcome;
        }

        if self.state != TcpState::Established && self.state != TcpState::FinWait {
            return outcome;
        }

        if !seg.payload.is_empty() {
            if seg.header.seq == self.rcv_nxt {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(seg.payload.len() as u32);
                self.bytes_in += seg.payload.len() as u64;
                outcome.forward_to_upstream = Some(seg.payload.to_vec());
                outcome.emit.push(self.build_ack());
            } else if seq_lt(seg.header.seq, self.rcv_nxt) {
                // Already-acknowledged retransmit, or out-of-order segment we
                // don't reassemble: duplicate ACK at the current rcv_nxt.
                outcome.emit.push(self.build_ack());
            }
        }

        if seg.header.flags.fin && seg.header.seq.wrapping_add(seg.payload.len() as u32) == self.rcv_nxt {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.client_fin_seen = true;
            outcome.emit.push(self.build_fin_ack());
            outcome.half_close_upstream = true;
            self.state = if self.upstream_eof_seen {
                TcpState::Closed
            } else {
                TcpState::FinWait
            };
            if self.state == TcpState::Closed {
                outcome.close = true;
            }
        }

        outcome
    }

    /// Chunks `payload` read from upstream into ≤ MSS segments and advances
    /// `snd_nxt` by the total length.
    pub fn build_data_segments(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in payload.chunks(MSS) {
            let seq = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(chunk.len() as u32);
            self.bytes_out += chunk.len() as u64;
            out.push(self.emit_segment(
                TcpFlags {
                    psh: true,
                    ack: true,
                    ..Default::default()
                },
                seq,
                chunk,
            ));
        }
        out
    }

    /// Upstream signalled EOF: emit our FIN and transition toward `Closed`
    /// once the client's FIN has also been observed.
    pub fn handle_upstream_eof(&mut self) -> Vec<u8> {
        self.upstream_eof_seen = true;
        let fin = self.build_fin_ack();
        self.state = if self.client_fin_seen {
            TcpState::Closed
        } else {
            TcpState::FinWait
        };
        fin
    }

    pub fn mark_closed(&mut self) {
        self.state = TcpState::Closed;
    }
}

/// Builds the RST sent when a non-SYN segment arrives for a 5-tuple with no
/// table entry. Free function since no `TcpFlow` exists yet.
pub fn reset_for_unmatched(key: &FlowKey, seg: &TcpSegment<'_>) -> Vec<u8> {
    let ack = seg.header.seq.wrapping_add(seg.payload.len() as u32).wrapping_add(
        u32::from(seg.header.flags.syn) + u32::from(seg.header.flags.fin),
    );
    let reversed = key.reversed();
    let segment = tcp::emit(
        reversed.src_ip,
        reversed.dst_ip,
        reversed.src_port,
        reversed.dst_port,
        0,
        ack,
        TcpFlags {
            rst: true,
            ack: true,
            ..Default::default()
        },
        0,
        &[],
    );
    ip::emit(reversed.src_ip, reversed.dst_ip, ip::PROTO_TCP, ip::next_identification(), &segment)
}

/// Builds the RST sent when a flow is evicted under capacity pressure (§8
/// S6). Unlike `reset_for_unmatched`, no inbound segment triggered this, so
/// the caller supplies the flow's own `(snd_nxt, rcv_nxt)` directly.
pub fn reset_for_eviction(key: &FlowKey, snd_nxt: u32, rcv_nxt: u32) -> Vec<u8> {
    let reversed = key.reversed();
    let segment = tcp::emit(
        reversed.src_ip,
        reversed.dst_ip,
        reversed.src_port,
        reversed.dst_port,
        snd_nxt,
        rcv_nxt,
        TcpFlags {
            rst: true,
            ack: true,
            ..Default::default()
        },
        0,
        &[],
    );
    ip::emit(reversed.src_ip, reversed.dst_ip, ip::PROTO_TCP, ip::next_identification(), &segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Protocol;

    fn test_key() -> FlowKey {
        FlowKey::new(
            Protocol::Tcp,
            Ipv4Addr::new(10, 0, 0, 2),
            40000,
            Ipv4Addr::new(203, 0, 113, 1),
            80,
        )
    }

    fn syn_segment(seq: u32) -> Vec<u8> {
        tcp::emit(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(203, 0, 113, 1),
            40000,
            80,
            seq,
            0,
            TcpFlags { syn: true, ..Default::default() },
            65535,
            &[],
        )
    }

    #[test]
    fn new_syn_received_sets_rcv_nxt_past_client_isn() {
        let raw = syn_segment(0x1000_0000);
        let seg = tcp::parse(&raw).unwrap();
        let flow = TcpFlow::new_syn_received(test_key(), &seg, Instant::now());
        assert_eq!(flow.rcv_nxt, 0x1000_0001);
        assert_eq!(flow.peer_iss, 0x1000_0000);
        assert_eq!(flow.state, TcpState::SynReceived);
    }

    #[test]
    fn in_order_data_advances_rcv_nxt_and_forwards_payload() {
        let raw = syn_segment(0x1000_0000);
        let seg = tcp::parse(&raw).unwrap();
        let mut flow = TcpFlow::new_syn_received(test_key(), &seg, Instant::now());
        flow.state = TcpState::Established;
        flow.snd_nxt = flow.our_iss.wrapping_add(1);

        let data = tcp::emit(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(203, 0, 113, 1),
            40000,
            80,
            0x1000_0001,
            flow.our_iss.wrapping_add(1),
            TcpFlags { ack: true, ..Default::default() },
            65535,
            b"hello",
        );
        let seg = tcp::parse(&data).unwrap();
        let outcome = flow.handle_client_segment(&seg, Instant::now());
        assert_eq!(flow.rcv_nxt, 0x1000_0006);
        assert_eq!(outcome.forward_to_upstream.as_deref(), Some(b"hello".as_ref()));
        assert_eq!(outcome.emit.len(), 1);
    }

    #[test]
    fn out_of_order_segment_is_dropped_with_duplicate_ack() {
        let raw = syn_segment(0x1000_0000);
        let seg = tcp::parse(&raw).unwrap();
        let mut flow = TcpFlow::new_syn_received(test_key(), &seg, Instant::now());
        flow.state = TcpState::Established;

        let data = tcp::emit(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(203, 0, 113, 1),
            40000,
            80,
            0x1000_0005, // not rcv_nxt (0x10000001)
            0,
            TcpFlags { ack: true, ..Default::default() },
            65535,
            b"late",
        );
        let seg = tcp::parse(&data).unwrap();
        let before = flow.rcv_nxt;
        let outcome = flow.handle_client_segment(&seg, Instant::now());
        assert_eq!(flow.rcv_nxt, before);
        assert!(outcome.forward_to_upstream.is_none());
    }

    #[test]
    fn data_segments_are_chunked_at_mss_and_advance_snd_nxt() {
        let raw = syn_segment(0x1000_0000);
        let seg = tcp::parse(&raw).unwrap();
        let mut flow = TcpFlow::new_syn_received(test_key(), &seg, Instant::now());
        flow.state = TcpState::Established;
        let start = flow.snd_nxt;
        let payload = vec![0x41u8; MSS * 2 + 10];
        let segments = flow.build_data_segments(&payload);
        assert_eq!(segments.len(), 3);
        assert_eq!(flow.snd_nxt, start.wrapping_add(payload.len() as u32));
    }

    #[test]
    fn reset_for_unmatched_acks_syn_plus_one() {
        let raw = syn_segment(0x1111_1111);
        let seg = tcp::parse(&raw).unwrap();
        let rst = reset_for_unmatched(&test_key(), &seg);
        let ip_pkt = ip::parse(&rst).unwrap();
        let tcp_seg = tcp::parse(ip_pkt.payload).unwrap();
        assert!(tcp_seg.header.flags.rst);
        assert_eq!(tcp_seg.header.ack, 0x1111_1112);
        assert_eq!(ip_pkt.header.src, Ipv4Addr::new(203, 0, 113, 1));
        assert_eq!(ip_pkt.header.dst, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn reset_for_eviction_carries_flow_seq_state_and_addressing() {
        let rst = reset_for_eviction(&test_key(), 0x2222_2222, 0x3333_3333);
        let ip_pkt = ip::parse(&rst).unwrap();
        let tcp_seg = tcp::parse(ip_pkt.payload).unwrap();
        assert!(tcp_seg.header.flags.rst);
        assert!(tcp_seg.header.flags.ack);
        assert_eq!(tcp_seg.header.seq, 0x2222_2222);
        assert_eq!(tcp_seg.header.ack, 0x3333_3333);
        assert_eq!(ip_pkt.header.src, Ipv4Addr::new(203, 0, 113, 1));
        assert_eq!(ip_pkt.header.dst, Ipv4Addr::new(10, 0, 0, 2));
    }
}
