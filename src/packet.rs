//! IPv4/TCP header view over a mutable packet buffer
//!
//! The only mutation offered is [`TcpPacket::rewrite_window`], and it always
//! recomputes the TCP checksum afterwards. A packet whose checksum no longer
//! matches its header would be silently dropped by the remote stack.

use std::net::Ipv4Addr;
use thiserror::Error;

use crate::connection::Direction;

const IPV4_MIN_HEADER: usize = 20;
const TCP_MIN_HEADER: usize = 20;
const IPPROTO_TCP: u8 = 6;

// Offsets inside the TCP header
const TCP_SEQ: usize = 4;
const TCP_ACK: usize = 8;
const TCP_OFFSET: usize = 12;
const TCP_FLAGS: usize = 13;
const TCP_WINDOW: usize = 14;
const TCP_CHECKSUM: usize = 16;

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;
const FLAG_ACK: u8 = 0x10;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WINDOW_SCALE: u8 = 3;

/// Largest shift RFC 7323 allows for the window scale option
pub const MAX_WINDOW_SCALE: u8 = 14;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("not an IPv4 packet")]
    NotIpv4,
    #[error("not a TCP segment")]
    NotTcp,
    #[error("packet truncated")]
    Truncated,
}

/// Parsed view of one IPv4 TCP segment
#[derive(Debug)]
pub struct TcpPacket<'a> {
    buf: &'a mut [u8],
    ip_header_len: usize,
    tcp_header_len: usize,
    total_len: usize,
}

/// Flag and size summary of a packet, detached from its buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketFacts {
    pub direction: Direction,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload_len: u32,
    pub window: u16,
    pub mss_option: Option<u16>,
    pub window_scale_option: Option<u8>,
}

impl<'a> TcpPacket<'a> {
    pub fn parse(buf: &'a mut [u8]) -> Result<Self, PacketError> {
        if buf.len() < IPV4_MIN_HEADER {
            return Err(PacketError::Truncated);
        }
        if buf[0] >> 4 != 4 {
            return Err(PacketError::NotIpv4);
        }
        let ip_header_len = usize::from(buf[0] & 0x0f) * 4;
        if ip_header_len < IPV4_MIN_HEADER {
            return Err(PacketError::NotIpv4);
        }
        if buf[9] != IPPROTO_TCP {
            return Err(PacketError::NotTcp);
        }

        let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        if total_len > buf.len() || total_len < ip_header_len + TCP_MIN_HEADER {
            return Err(PacketError::Truncated);
        }

        let tcp_header_len = usize::from(buf[ip_header_len + TCP_OFFSET] >> 4) * 4;
        if tcp_header_len < TCP_MIN_HEADER || ip_header_len + tcp_header_len > total_len {
            return Err(PacketError::Truncated);
        }

        Ok(Self {
            buf,
            ip_header_len,
            tcp_header_len,
            total_len,
        })
    }

    fn tcp(&self, offset: usize) -> usize {
        self.ip_header_len + offset
    }

    fn read_u16(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.buf[at], self.buf[at + 1]])
    }

    fn read_u32(&self, at: usize) -> u32 {
        u32::from_be_bytes([
            self.buf[at],
            self.buf[at + 1],
            self.buf[at + 2],
            self.buf[at + 3],
        ])
    }

    fn flags(&self) -> u8 {
        self.buf[self.tcp(TCP_FLAGS)]
    }

    pub fn source_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.read_u32(12))
    }

    pub fn dest_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.read_u32(16))
    }

    pub fn source_port(&self) -> u16 {
        self.read_u16(self.tcp(0))
    }

    pub fn dest_port(&self) -> u16 {
        self.read_u16(self.tcp(2))
    }

    pub fn seq(&self) -> u32 {
        self.read_u32(self.tcp(TCP_SEQ))
    }

    pub fn ack_seq(&self) -> u32 {
        self.read_u32(self.tcp(TCP_ACK))
    }

    pub fn syn(&self) -> bool {
        self.flags() & FLAG_SYN != 0
    }

    pub fn ack(&self) -> bool {
        self.flags() & FLAG_ACK != 0
    }

    pub fn fin(&self) -> bool {
        self.flags() & FLAG_FIN != 0
    }

    pub fn rst(&self) -> bool {
        self.flags() & FLAG_RST != 0
    }

    /// Raw (unscaled) window field
    pub fn window(&self) -> u16 {
        self.read_u16(self.tcp(TCP_WINDOW))
    }

    pub fn checksum(&self) -> u16 {
        self.read_u16(self.tcp(TCP_CHECKSUM))
    }

    /// TCP payload bytes: IP total length minus both headers
    pub fn payload_len(&self) -> u32 {
        (self.total_len - self.ip_header_len - self.tcp_header_len) as u32
    }

    /// Iterate over (kind, data) pairs of the TCP options area
    fn options(&self) -> impl Iterator<Item = (u8, &[u8])> + '_ {
        let area = &self.buf[self.tcp(TCP_MIN_HEADER)..self.tcp(self.tcp_header_len)];
        let mut pos = 0;
        std::iter::from_fn(move || {
            while pos < area.len() {
                match area[pos] {
                    OPT_END => return None,
                    OPT_NOP => pos += 1,
                    kind => {
                        let len = usize::from(*area.get(pos + 1)?);
                        if len < 2 || pos + len > area.len() {
                            return None;
                        }
                        let data = &area[pos + 2..pos + len];
                        pos += len;
                        return Some((kind, data));
                    }
                }
            }
            None
        })
    }

    pub fn mss_option(&self) -> Option<u16> {
        self.options()
            .find(|(kind, data)| *kind == OPT_MSS && data.len() == 2)
            .map(|(_, data)| u16::from_be_bytes([data[0], data[1]]))
    }

    pub fn window_scale_option(&self) -> Option<u8> {
        self.options()
            .find(|(kind, data)| *kind == OPT_WINDOW_SCALE && data.len() == 1)
            .map(|(_, data)| data[0])
    }

    pub fn facts(&self, direction: Direction) -> PacketFacts {
        let syn = self.syn();
        PacketFacts {
            direction,
            syn,
            ack: self.ack(),
            fin: self.fin(),
            rst: self.rst(),
            payload_len: self.payload_len(),
            window: self.window(),
            mss_option: if syn { self.mss_option() } else { None },
            window_scale_option: if syn {
                self.window_scale_option()
            } else {
                None
            },
        }
    }

    /// Advertise `window_bytes` using the negotiated `scale`
    ///
    /// Returns false, leaving the packet untouched, when the scale is out of
    /// range. Values that don't fit the 16-bit field are clamped.
    pub fn rewrite_window(&mut self, window_bytes: u32, scale: u8) -> bool {
        if scale > MAX_WINDOW_SCALE {
            return false;
        }
        let field = (window_bytes >> scale).min(u32::from(u16::MAX)) as u16;
        let at = self.tcp(TCP_WINDOW);
        self.buf[at..at + 2].copy_from_slice(&field.to_be_bytes());
        self.update_checksum();
        true
    }

    fn compute_checksum(&self) -> u16 {
        let segment = &self.buf[self.ip_header_len..self.total_len];
        let mut sum: u32 = 0;

        // Pseudo-header: source, destination, zero, protocol, TCP length
        for chunk in self.buf[12..20].chunks_exact(2) {
            sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        sum += u32::from(IPPROTO_TCP);
        sum += segment.len() as u32;

        for (i, chunk) in segment.chunks(2).enumerate() {
            // checksum field itself counts as zero
            if i == TCP_CHECKSUM / 2 {
                continue;
            }
            let word = match chunk {
                [hi, lo] => u16::from_be_bytes([*hi, *lo]),
                [hi] => u16::from_be_bytes([*hi, 0]),
                _ => 0,
            };
            sum += u32::from(word);
        }

        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }

    fn update_checksum(&mut self) {
        let checksum = self.compute_checksum();
        let at = self.tcp(TCP_CHECKSUM);
        self.buf[at..at + 2].copy_from_slice(&checksum.to_be_bytes());
    }

    pub fn checksum_valid(&self) -> bool {
        self.compute_checksum() == self.checksum()
    }
}

// ============================================================================
// TEST PACKET BUILDER
// ============================================================================

/// Assembles IPv4 TCP segments with a correct checksum
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct PacketBuilder {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
    pub window: u16,
    pub mss: Option<u16>,
    pub wscale: Option<u8>,
    pub payload: usize,
    pub seq: u32,
    pub ack_seq: u32,
}

#[cfg(test)]
impl PacketBuilder {
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        Self {
            src: Ipv4Addr::new(10, 0, 0, 2),
            dst: Ipv4Addr::new(93, 184, 216, 34),
            src_port,
            dst_port,
            flags: FLAG_ACK,
            window: 0xffff,
            mss: None,
            wscale: None,
            payload: 0,
            seq: 1000,
            ack_seq: 0,
        }
    }

    pub fn syn(mut self) -> Self {
        self.flags = FLAG_SYN;
        self
    }

    pub fn syn_ack(mut self) -> Self {
        self.flags = FLAG_SYN | FLAG_ACK;
        self
    }

    pub fn fin(mut self) -> Self {
        self.flags = FLAG_FIN | FLAG_ACK;
        self
    }

    pub fn payload(mut self, len: usize) -> Self {
        self.payload = len;
        self
    }

    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn ack_seq(mut self, ack_seq: u32) -> Self {
        self.ack_seq = ack_seq;
        self
    }

    pub fn window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    pub fn mss(mut self, mss: u16) -> Self {
        self.mss = Some(mss);
        self
    }

    pub fn wscale(mut self, shift: u8) -> Self {
        self.wscale = Some(shift);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut options = Vec::new();
        if let Some(mss) = self.mss {
            options.extend_from_slice(&[OPT_MSS, 4]);
            options.extend_from_slice(&mss.to_be_bytes());
        }
        if let Some(shift) = self.wscale {
            options.extend_from_slice(&[OPT_NOP, OPT_WINDOW_SCALE, 3, shift]);
        }
        while options.len() % 4 != 0 {
            options.push(OPT_END);
        }

        let tcp_len = TCP_MIN_HEADER + options.len();
        let total = IPV4_MIN_HEADER + tcp_len + self.payload;
        let mut buf = vec![0u8; total];

        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        buf[8] = 64;
        buf[9] = IPPROTO_TCP;
        buf[12..16].copy_from_slice(&self.src.octets());
        buf[16..20].copy_from_slice(&self.dst.octets());

        let t = IPV4_MIN_HEADER;
        buf[t..t + 2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[t + 2..t + 4].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[t + TCP_SEQ..t + TCP_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[t + TCP_ACK..t + TCP_ACK + 4].copy_from_slice(&self.ack_seq.to_be_bytes());
        buf[t + TCP_OFFSET] = ((tcp_len / 4) as u8) << 4;
        buf[t + TCP_FLAGS] = self.flags;
        buf[t + TCP_WINDOW..t + TCP_WINDOW + 2].copy_from_slice(&self.window.to_be_bytes());
        buf[t + TCP_MIN_HEADER..t + tcp_len].copy_from_slice(&options);
        for (i, byte) in buf[t + tcp_len..].iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }

        let mut packet = TcpPacket::parse(&mut buf).unwrap();
        packet.update_checksum();
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields() {
        let mut buf = PacketBuilder::new(40000, 80)
            .syn()
            .mss(1400)
            .wscale(7)
            .window(29200)
            .build();
        let packet = TcpPacket::parse(&mut buf).unwrap();

        assert_eq!(packet.source_port(), 40000);
        assert_eq!(packet.dest_port(), 80);
        assert!(packet.syn());
        assert!(!packet.ack());
        assert_eq!(packet.window(), 29200);
        assert_eq!(packet.mss_option(), Some(1400));
        assert_eq!(packet.window_scale_option(), Some(7));
        assert_eq!(packet.payload_len(), 0);
        assert!(packet.checksum_valid());
    }

    #[test]
    fn test_payload_length_excludes_options() {
        let mut buf = PacketBuilder::new(80, 40000).mss(1460).payload(333).build();
        let packet = TcpPacket::parse(&mut buf).unwrap();
        assert_eq!(packet.payload_len(), 333);
    }

    #[test]
    fn test_rejects_non_tcp() {
        let mut buf = PacketBuilder::new(1, 2).build();
        buf[9] = 17;
        assert_eq!(TcpPacket::parse(&mut buf).unwrap_err(), PacketError::NotTcp);
    }

    #[test]
    fn test_rejects_ipv6_and_truncation() {
        let mut buf = PacketBuilder::new(1, 2).build();
        buf[0] = 0x60;
        assert_eq!(TcpPacket::parse(&mut buf).unwrap_err(), PacketError::NotIpv4);

        let mut short = PacketBuilder::new(1, 2).build();
        short.truncate(30);
        assert_eq!(
            TcpPacket::parse(&mut short).unwrap_err(),
            PacketError::Truncated
        );
    }

    #[test]
    fn test_rewrite_window_scales_and_fixes_checksum() {
        let mut buf = PacketBuilder::new(40000, 80).payload(11).build();
        let mut packet = TcpPacket::parse(&mut buf).unwrap();

        assert!(packet.rewrite_window(64 * 1024, 4));
        assert_eq!(packet.window(), 4096);
        assert!(packet.checksum_valid());

        assert!(packet.rewrite_window(0, 4));
        assert_eq!(packet.window(), 0);
        assert!(packet.checksum_valid());
    }

    #[test]
    fn test_rewrite_window_clamps_to_field() {
        let mut buf = PacketBuilder::new(40000, 80).build();
        let mut packet = TcpPacket::parse(&mut buf).unwrap();
        assert!(packet.rewrite_window(10_000_000, 0));
        assert_eq!(packet.window(), u16::MAX);
    }

    #[test]
    fn test_invalid_scale_is_skipped() {
        let mut buf = PacketBuilder::new(40000, 80).window(1234).build();
        let before = buf.clone();
        let mut packet = TcpPacket::parse(&mut buf).unwrap();
        assert!(!packet.rewrite_window(0, 15));
        assert_eq!(buf, before);
    }

    #[test]
    fn test_malformed_option_length_stops_scan() {
        let mut buf = PacketBuilder::new(40000, 80).syn().mss(1400).build();
        // corrupt the MSS option length
        buf[IPV4_MIN_HEADER + TCP_MIN_HEADER + 1] = 0;
        let packet = TcpPacket::parse(&mut buf).unwrap();
        assert_eq!(packet.mss_option(), None);
    }
}
