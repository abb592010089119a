//! Netlink message framing
//!
//! Building and splitting `nlmsghdr`-framed buffers. The control channel
//! uses the same framing as the kernel's sock_diag interface, so both share
//! this code.

use std::collections::HashMap;

use crate::error::{MonitorError, Result};
use crate::netlink::structures::*;

/// View a plain-old-data struct as raw bytes
///
/// Only used for the `#[repr(C)]` netlink structs, which are all `Copy` and
/// free of padding-dependent invariants.
fn struct_bytes<T: Copy>(value: &T) -> &[u8] {
    // SAFETY: `value` is a valid reference for size_of::<T>() bytes and the
    // returned slice borrows it, so it cannot outlive the struct.
    unsafe {
        std::slice::from_raw_parts((value as *const T).cast::<u8>(), std::mem::size_of::<T>())
    }
}

/// Frame `payload` in a netlink header, padded to 4 bytes
pub fn build_message(msg_type: u16, flags: u16, seq: u32, pid: u32, payload: &[u8]) -> Vec<u8> {
    let header = NlMsgHdr {
        nlmsg_len: nlmsg_length(payload.len()),
        nlmsg_type: msg_type,
        nlmsg_flags: flags,
        nlmsg_seq: seq,
        nlmsg_pid: pid,
    };
    let mut buffer = Vec::with_capacity(nlmsg_align(NLMSG_HDR_LEN + payload.len()));
    buffer.extend_from_slice(struct_bytes(&header));
    buffer.extend_from_slice(payload);
    buffer.resize(nlmsg_align(buffer.len()), 0);
    buffer
}

/// `SOCK_DIAG_BY_FAMILY` request carrying `req`
pub fn build_inet_diag_request(req: &InetDiagReqV2, seq: u32) -> Vec<u8> {
    build_message(SOCK_DIAG_BY_FAMILY, NLM_F_REQUEST, seq, 0, struct_bytes(req))
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Read a netlink header from the front of `data`, if it is long enough
pub fn parse_header(data: &[u8]) -> Option<NlMsgHdr> {
    if data.len() < NLMSG_HDR_LEN {
        return None;
    }
    Some(NlMsgHdr {
        nlmsg_len: read_u32(data, 0),
        nlmsg_type: read_u16(data, 4),
        nlmsg_flags: read_u16(data, 6),
        nlmsg_seq: read_u32(data, 8),
        nlmsg_pid: read_u32(data, 12),
    })
}

/// One framed message borrowed from a receive buffer
#[derive(Debug, Clone, Copy)]
pub struct RawMessage<'a> {
    pub header: NlMsgHdr,
    pub payload: &'a [u8],
}

/// Split a buffer into its netlink messages
pub fn split_messages(data: &[u8]) -> Result<Vec<RawMessage<'_>>> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDR_LEN <= data.len() {
        let Some(header) = parse_header(&data[offset..]) else {
            break;
        };
        let msg_len = header.nlmsg_len as usize;
        if msg_len < NLMSG_HDR_LEN {
            return Err(MonitorError::netlink(format!(
                "invalid message length {msg_len} (minimum {NLMSG_HDR_LEN})"
            )));
        }
        if offset + msg_len > data.len() {
            return Err(MonitorError::netlink(format!(
                "message length {msg_len} exceeds buffer (offset={offset}, buffer={})",
                data.len()
            )));
        }
        messages.push(RawMessage {
            header,
            payload: &data[offset + NLMSG_HDR_LEN..offset + msg_len],
        });
        offset += nlmsg_align(msg_len);
    }

    Ok(messages)
}

/// Positive errno carried by an `NLMSG_ERROR` payload (0 is an ACK)
pub fn parse_error_payload(payload: &[u8]) -> Result<i32> {
    if payload.len() < 4 {
        return Err(MonitorError::netlink("error message too small"));
    }
    Ok(-(read_u32(payload, 0) as i32))
}

/// `inet_diag_msg` at the start of a `SOCK_DIAG_BY_FAMILY` payload
pub fn parse_inet_diag_msg(payload: &[u8]) -> Result<InetDiagMsg> {
    if payload.len() < std::mem::size_of::<InetDiagMsg>() {
        return Err(MonitorError::netlink("buffer too small for inet_diag_msg"));
    }
    // SAFETY: length checked above; InetDiagMsg is repr(C) plain data and
    // read_unaligned tolerates any alignment of the receive buffer.
    Ok(unsafe { std::ptr::read_unaligned(payload.as_ptr().cast::<InetDiagMsg>()) })
}

/// Attribute type → payload map for the bytes after an `inet_diag_msg`
pub fn parse_attributes(data: &[u8]) -> Result<HashMap<u16, Vec<u8>>> {
    let header_len = std::mem::size_of::<RtAttr>();
    let mut attrs = HashMap::new();
    let mut offset = 0;

    while offset + header_len <= data.len() {
        let attr_len = usize::from(read_u16(data, offset));
        let attr_type = read_u16(data, offset + 2);
        if attr_len < header_len {
            break;
        }
        if offset + attr_len > data.len() {
            return Err(MonitorError::netlink(format!(
                "attribute length {attr_len} exceeds buffer (offset={offset}, buffer={})",
                data.len()
            )));
        }
        attrs.insert(attr_type, data[offset + header_len..offset + attr_len].to_vec());
        offset += rta_align(attr_len);
    }

    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_build_message_pads_and_frames() {
        let message = build_message(NLMSG_DONE, 0, 7, 0, b"2,10,1,1,40000,1400");
        assert_eq!(message.len() % 4, 0);

        let header = parse_header(&message).unwrap();
        assert_eq!(header.nlmsg_type, NLMSG_DONE);
        assert_eq!(header.nlmsg_seq, 7);
        assert_eq!(header.nlmsg_len as usize, NLMSG_HDR_LEN + 19);

        let split = split_messages(&message).unwrap();
        assert_eq!(split.len(), 1);
        assert_eq!(split[0].payload, b"2,10,1,1,40000,1400");
    }

    #[test]
    fn test_inet_diag_request_layout() {
        let req = InetDiagReqV2 {
            sdiag_family: AF_INET,
            sdiag_protocol: IPPROTO_TCP,
            idiag_ext: 1 << (INET_DIAG_INFO - 1),
            pad: 0,
            idiag_states: 1 << TCP_ESTABLISHED,
            id: build_exact_socket_id(
                Ipv4Addr::new(10, 0, 0, 2),
                40000,
                Ipv4Addr::new(10, 0, 0, 1),
                80,
            ),
        };
        let message = build_inet_diag_request(&req, 12345);
        assert_eq!(message.len(), 72);

        let header = parse_header(&message).unwrap();
        assert_eq!(header.nlmsg_type, SOCK_DIAG_BY_FAMILY);
        assert_eq!(header.nlmsg_flags, NLM_F_REQUEST);
        assert_eq!(header.nlmsg_seq, 12345);
    }

    #[test]
    fn test_split_multiple_and_error() {
        let mut data = build_message(NLMSG_NOOP, 0, 1, 0, &[1, 2, 3]);
        data.extend(build_message(NLMSG_ERROR, 0, 2, 0, &(-2i32).to_ne_bytes()));

        let split = split_messages(&data).unwrap();
        assert_eq!(split.len(), 2);
        assert_eq!(split[0].payload, &[1, 2, 3]);
        assert_eq!(parse_error_payload(split[1].payload).unwrap(), 2);
    }

    #[test]
    fn test_split_rejects_overlong_length() {
        let mut data = build_message(NLMSG_DONE, 0, 0, 0, &[]);
        data[0..4].copy_from_slice(&100u32.to_ne_bytes());
        assert!(split_messages(&data).is_err());
    }

    #[test]
    fn test_parse_attributes() {
        let mut data = Vec::new();
        data.extend_from_slice(&6u16.to_ne_bytes());
        data.extend_from_slice(&INET_DIAG_INFO.to_ne_bytes());
        data.extend_from_slice(&[0xaa, 0xbb, 0, 0]);
        data.extend_from_slice(&5u16.to_ne_bytes());
        data.extend_from_slice(&9u16.to_ne_bytes());
        data.extend_from_slice(&[0xcc, 0, 0, 0]);

        let attrs = parse_attributes(&data).unwrap();
        assert_eq!(attrs[&INET_DIAG_INFO], vec![0xaa, 0xbb]);
        assert_eq!(attrs[&9], vec![0xcc]);
    }
}
