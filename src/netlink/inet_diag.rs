//! Single-socket `INET_DIAG` query
//!
//! Asks the kernel for the `tcp_info` of one established IPv4 socket,
//! identified by its exact 4-tuple.
//!
//! # Educational Notes
//!
//! ## What This Module Does
//!
//! This is the glue between the monitor and the netlink plumbing:
//! 1. Takes a [`FlowKey`] (the local and remote address and port)
//! 2. Builds an `inet_diag_req_v2` asking for `INET_DIAG_INFO` only
//! 3. Sends it on a fresh `NETLINK_SOCK_DIAG` socket
//! 4. Splits the reply into netlink messages
//! 5. Pulls the `tcp_info` attribute out of the matching message
//! 6. Returns the few fields the throttle logic needs as a [`TcpInfoSample`]
//!
//! ## API Design
//!
//! There is one query, by exact 4-tuple. The kernel does the matching, so
//! the reply holds at most one socket and nothing is filtered in userspace.
//!
//! [`InetDiagSource`] wraps the query behind the [`TcpInfoSource`] trait so
//! the monitor can be driven by a fake source in tests.
//!
//! ## Error Handling Strategy
//!
//! [`query_tcp_info`] reports typed failures through [`InetDiagError`].
//! The trait implementation turns every failure into `None` and logs it at
//! debug level: a missing sample only means the handshake-derived RTT,
//! window scale and MSS stay in use.
//!
//! ## Performance Considerations
//!
//! - One socket per query, closed on drop
//! - Queried on generic-timer expiry only, never on the packet path
//! - Called with no registry or connection lock held

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;
use tracing::debug;

use crate::error::MonitorError;
use crate::netlink::message::{
    build_inet_diag_request, parse_attributes, parse_error_payload, parse_inet_diag_msg,
    split_messages,
};
use crate::netlink::socket::NetlinkSocket;
use crate::netlink::structures::*;
use crate::netlink::tcp_info::parse_tcp_info;
use crate::netlink::{FlowKey, TcpInfoSample, TcpInfoSource};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during an INET_DIAG query
///
/// # Error Categories
///
/// - **Socket**: the netlink socket could not be opened, written or read
/// - **Message**: the reply was truncated or malformed
/// - **NotFound**: no established socket matches the 4-tuple
/// - **PermissionDenied**: the kernel wants `CAP_NET_ADMIN`
/// - **Kernel**: any other errno carried in an `NLMSG_ERROR`
///
/// # Example
///
/// ```no_run
/// # use psm_throttle::netlink::FlowKey;
/// # use psm_throttle::netlink::inet_diag::*;
/// # use std::net::Ipv4Addr;
/// let key = FlowKey {
///     local_addr: Ipv4Addr::new(10, 0, 0, 2),
///     local_port: 40000,
///     remote_addr: Ipv4Addr::new(10, 0, 0, 1),
///     remote_port: 80,
/// };
/// match query_tcp_info(&key) {
///     Ok(sample) => println!("srtt: {} us", sample.rtt_us),
///     Err(InetDiagError::NotFound) => println!("socket is gone"),
///     Err(e) => eprintln!("query failed: {e}"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum InetDiagError {
    /// Socket operation failed
    #[error("netlink socket: {0}")]
    Socket(#[from] io::Error),

    /// Reply could not be parsed
    #[error(transparent)]
    Message(#[from] MonitorError),

    /// No socket matches the 4-tuple
    #[error("socket not found")]
    NotFound,

    /// Need CAP_NET_ADMIN on some kernels
    #[error("permission denied (CAP_NET_ADMIN may be required)")]
    PermissionDenied,

    /// Any other errno from the kernel
    #[error("kernel returned errno {0}")]
    Kernel(i32),
}

// ============================================================================
// QUERY
// ============================================================================

/// Netlink sequence numbers, shared by every query in the process
static SEQUENCE: AtomicU32 = AtomicU32::new(1);

/// Query the kernel for the `tcp_info` of one established IPv4 socket
///
/// The request matches the exact 4-tuple in `key` and only asks for the
/// `INET_DIAG_INFO` extension. The first `SOCK_DIAG_BY_FAMILY` message that
/// carries the attribute wins.
///
/// # Errors
///
/// - [`InetDiagError::NotFound`] when the reply ends with no match, or the
///   kernel answers `ENOENT`
/// - [`InetDiagError::PermissionDenied`] on `EACCES` or `EPERM`
/// - [`InetDiagError::Socket`] and [`InetDiagError::Message`] for transport
///   and parsing failures
pub fn query_tcp_info(key: &FlowKey) -> Result<TcpInfoSample, InetDiagError> {
    let socket = NetlinkSocket::new()?;

    let req = InetDiagReqV2 {
        sdiag_family: AF_INET,
        sdiag_protocol: IPPROTO_TCP,
        idiag_ext: 1 << (INET_DIAG_INFO - 1),
        pad: 0,
        idiag_states: 1 << TCP_ESTABLISHED,
        id: build_exact_socket_id(key.local_addr, key.local_port, key.remote_addr, key.remote_port),
    };
    socket.send(&build_inet_diag_request(&req, SEQUENCE.fetch_add(1, Ordering::Relaxed)))?;

    let response = socket.recv_all()?;
    for message in split_messages(&response)? {
        match message.header.nlmsg_type {
            SOCK_DIAG_BY_FAMILY => {
                let header_len = std::mem::size_of::<InetDiagMsg>();
                parse_inet_diag_msg(message.payload)?;
                let attributes = parse_attributes(&message.payload[header_len..])?;
                if let Some(raw) = attributes.get(&INET_DIAG_INFO) {
                    return Ok(parse_tcp_info(raw)?.sample());
                }
            }
            NLMSG_ERROR => match parse_error_payload(message.payload)? {
                0 => {}
                libc::ENOENT => return Err(InetDiagError::NotFound),
                libc::EACCES | libc::EPERM => return Err(InetDiagError::PermissionDenied),
                errno => return Err(InetDiagError::Kernel(errno)),
            },
            _ => {}
        }
    }

    Err(InetDiagError::NotFound)
}

// ============================================================================
// TCP INFO SOURCE
// ============================================================================

/// [`TcpInfoSource`] backed by the kernel's sock_diag interface
///
/// Stateless: every query opens and closes its own socket, so one value can
/// be shared by all timer callbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct InetDiagSource;

impl InetDiagSource {
    /// Create a source; no socket is opened until the first query
    pub fn new() -> Self {
        Self
    }
}

impl TcpInfoSource for InetDiagSource {
    fn query(&self, key: &FlowKey) -> Option<TcpInfoSample> {
        match query_tcp_info(key) {
            Ok(sample) => Some(sample),
            Err(e) => {
                debug!(
                    local_port = key.local_port,
                    remote_port = key.remote_port,
                    error = %e,
                    "tcp_info query failed"
                );
                None
            }
        }
    }
}
