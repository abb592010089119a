//! Netlink wire structures
//!
//! `#[repr(C)]` mirrors of the kernel's netlink and `INET_DIAG` headers.
//! Header fields are host byte order; ports and addresses inside
//! `InetDiagSockId` are network byte order.
//!
//! # Request Layout
//!
//! A tcp_info query is a single netlink message:
//!
//! ```text
//! +------------------+  0
//! | NlMsgHdr         |  len, SOCK_DIAG_BY_FAMILY, NLM_F_REQUEST, seq, pid 0
//! +------------------+ 16
//! | InetDiagReqV2    |  AF_INET, IPPROTO_TCP, ext mask, state mask
//! |   InetDiagSockId |  sport, dport, src, dst, if, cookie
//! +------------------+ 72
//! ```
//!
//! The reply is a stream of messages, each an `NlMsgHdr` followed by an
//! `InetDiagMsg` and a run of `RtAttr`-framed attributes. `INET_DIAG_INFO`
//! carries the raw `tcp_info`. The stream ends with `NLMSG_DONE`, or with
//! `NLMSG_ERROR` holding a negated errno.

use std::net::Ipv4Addr;

/// Netlink message header (16 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlMsgHdr {
    /// Length of the whole message, header included
    pub nlmsg_len: u32,
    /// `SOCK_DIAG_BY_FAMILY`, `NLMSG_DONE`, `NLMSG_ERROR`, ...
    pub nlmsg_type: u16,
    pub nlmsg_flags: u16,
    /// Echoed back by the kernel in every reply message
    pub nlmsg_seq: u32,
    /// 0 when addressed to the kernel
    pub nlmsg_pid: u32,
}

/// Socket identity inside an `INET_DIAG` request (48 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InetDiagSockId {
    /// Local port, network byte order
    pub idiag_sport: u16,
    /// Remote port, network byte order
    pub idiag_dport: u16,
    /// Local address; IPv4 uses the first word only
    pub idiag_src: [u32; 4],
    /// Remote address; IPv4 uses the first word only
    pub idiag_dst: [u32; 4],
    /// Interface index, 0 for any
    pub idiag_if: u32,
    /// `INET_DIAG_NOCOOKIE` (all ones) when the socket is unknown
    pub idiag_cookie: [u32; 2],
}

/// `inet_diag_req_v2` (56 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InetDiagReqV2 {
    pub sdiag_family: u8,
    pub sdiag_protocol: u8,
    /// Bit `n - 1` requests extension attribute `n`
    pub idiag_ext: u8,
    pub pad: u8,
    /// Bit `n` matches TCP state `n`
    pub idiag_states: u32,
    pub id: InetDiagSockId,
}

/// `inet_diag_msg` (72 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InetDiagMsg {
    pub idiag_family: u8,
    pub idiag_state: u8,
    pub idiag_timer: u8,
    pub idiag_retrans: u8,
    pub id: InetDiagSockId,
    pub idiag_expires: u32,
    pub idiag_rqueue: u32,
    pub idiag_wqueue: u32,
    pub idiag_uid: u32,
    pub idiag_inode: u32,
}

/// Attribute header following an `inet_diag_msg` (4 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RtAttr {
    pub rta_len: u16,
    pub rta_type: u16,
}

// ============================================================================
// CONSTANTS
// ============================================================================

pub const NLMSG_HDR_LEN: usize = std::mem::size_of::<NlMsgHdr>();

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const SOCK_DIAG_BY_FAMILY: u16 = 20;

pub const NLM_F_REQUEST: u16 = 1;

pub const AF_INET: u8 = 2;
pub const IPPROTO_TCP: u8 = 6;
pub const TCP_ESTABLISHED: u32 = 1;
pub const INET_DIAG_INFO: u16 = 2;

// ============================================================================
// ALIGNMENT HELPERS
// ============================================================================

/// Round up to the 4-byte netlink message alignment
#[must_use]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// `nlmsg_len` for a message carrying `payload_len` bytes
#[must_use]
pub const fn nlmsg_length(payload_len: usize) -> u32 {
    (NLMSG_HDR_LEN + payload_len) as u32
}

/// Round up to the 4-byte attribute alignment
#[must_use]
pub const fn rta_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Socket id matching exactly one IPv4 4-tuple
#[must_use]
pub fn build_exact_socket_id(
    local_ip: Ipv4Addr,
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
) -> InetDiagSockId {
    InetDiagSockId {
        idiag_sport: local_port.to_be(),
        idiag_dport: remote_port.to_be(),
        idiag_src: [u32::from(local_ip).to_be(), 0, 0, 0],
        idiag_dst: [u32::from(remote_ip).to_be(), 0, 0, 0],
        idiag_if: 0,
        // INET_DIAG_NOCOOKIE
        idiag_cookie: [u32::MAX, u32::MAX],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(std::mem::size_of::<NlMsgHdr>(), 16);
        assert_eq!(std::mem::size_of::<InetDiagSockId>(), 48);
        assert_eq!(std::mem::size_of::<InetDiagReqV2>(), 56);
        assert_eq!(std::mem::size_of::<InetDiagMsg>(), 72);
        assert_eq!(std::mem::size_of::<RtAttr>(), 4);
    }

    #[test]
    fn test_alignment() {
        assert_eq!(nlmsg_align(0), 0);
        assert_eq!(nlmsg_align(1), 4);
        assert_eq!(nlmsg_align(5), 8);
        assert_eq!(nlmsg_align(73), 76);
        assert_eq!(nlmsg_length(56), 72);
    }

    #[test]
    fn test_socket_id_byte_order() {
        let id = build_exact_socket_id(
            Ipv4Addr::new(10, 0, 0, 2),
            40000,
            Ipv4Addr::new(93, 184, 216, 34),
            443,
        );
        assert_eq!(id.idiag_sport, 40000u16.to_be());
        assert_eq!(id.idiag_dport, 443u16.to_be());
        assert_eq!(id.idiag_src[0], u32::from(Ipv4Addr::new(10, 0, 0, 2)).to_be());
    }
}
