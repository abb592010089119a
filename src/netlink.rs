//! Netlink plumbing
//!
//! Two users share the framing code here: the control channel, which speaks
//! `nlmsghdr`-framed datagrams to the external controller, and the optional
//! `INET_DIAG` lookup that fills in RTT, window scale and MSS from the
//! kernel's own `tcp_info` for a flow.

use std::net::Ipv4Addr;

use serde::Serialize;

pub mod message;
pub mod structures;
pub mod tcp_info;

// sock_diag needs a Linux kernel
#[cfg(all(target_os = "linux", feature = "netlink"))]
pub mod inet_diag;
#[cfg(all(target_os = "linux", feature = "netlink"))]
pub mod socket;

#[cfg(all(target_os = "linux", feature = "netlink"))]
pub use inet_diag::{InetDiagError, InetDiagSource, query_tcp_info};

/// Local/remote IPv4 4-tuple of a monitored socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
}

/// The kernel's view of a socket, as far as throttling cares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TcpInfoSample {
    pub rtt_us: u64,
    pub rttvar_us: u64,
    pub rcv_rtt_us: u64,
    pub rcv_wscale: u8,
    pub rcv_mss: u32,
}

/// Where per-flow `tcp_info` comes from
///
/// `None` means "no answer"; callers fall back to handshake measurements.
pub trait TcpInfoSource: Send + Sync {
    fn query(&self, key: &FlowKey) -> Option<TcpInfoSample>;
}
