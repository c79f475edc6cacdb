//! `tunwire` — a user-space packet router that tunnels TUN traffic through
//! a SOCKS5 proxy: IPv4 parsing, a TCP connection tracker bridged to SOCKS5
//! CONNECT, a UDP/DNS handler bridged to SOCKS5 UDP ASSOCIATE (or DNS-over-
//! TCP), a bounded connection table, and the SOCKS5 client state machines.
//!
//! The TUN device itself, the SOCKS5 server, and any UI/configuration
//! layer above this crate are external collaborators — this crate only
//! consumes a byte-stream pair and a proxy endpoint.

pub mod checksum;
pub mod error;
pub mod flow;
pub mod ip;
pub mod router;
pub mod socks5;
pub mod table;
pub mod tcp;
pub mod tun;
pub mod udp;

pub use error::{FlowError, ParseError, ProtocolError, SocksReplyCode};
pub use router::{Router, RouterConfig, RouterHandle};
pub use table::{FlowKey, Protocol, StatsSnapshot};
