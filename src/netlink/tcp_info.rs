//! `struct tcp_info` decoding
//!
//! Only the leading block every kernel since 3.10 fills in is decoded; the
//! monitor needs the RTT estimates, the receive scale and the receive MSS.

use crate::error::{MonitorError, Result};
use crate::netlink::TcpInfoSample;

/// Leading, version-stable part of the kernel's `struct tcp_info` (104 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpInfoBasic {
    pub tcpi_state: u8,
    pub tcpi_ca_state: u8,
    pub tcpi_retransmits: u8,
    pub tcpi_probes: u8,
    pub tcpi_backoff: u8,
    pub tcpi_options: u8,
    /// snd_wscale in the low nibble, rcv_wscale in the high nibble
    pub tcpi_wscale: u8,
    pub tcpi_flags: u8,

    pub tcpi_rto: u32,
    pub tcpi_ato: u32,
    pub tcpi_snd_mss: u32,
    pub tcpi_rcv_mss: u32,

    pub tcpi_unacked: u32,
    pub tcpi_sacked: u32,
    pub tcpi_lost: u32,
    pub tcpi_retrans: u32,
    pub tcpi_fackets: u32,

    pub tcpi_last_data_sent: u32,
    pub tcpi_last_ack_sent: u32,
    pub tcpi_last_data_recv: u32,
    pub tcpi_last_ack_recv: u32,

    pub tcpi_pmtu: u32,
    pub tcpi_rcv_ssthresh: u32,
    pub tcpi_rtt: u32,
    pub tcpi_rttvar: u32,
    pub tcpi_snd_ssthresh: u32,
    pub tcpi_snd_cwnd: u32,
    pub tcpi_advmss: u32,
    pub tcpi_reordering: u32,
    pub tcpi_rcv_rtt: u32,
    pub tcpi_rcv_space: u32,

    pub tcpi_total_retrans: u32,
}

impl TcpInfoBasic {
    pub fn rcv_wscale(&self) -> u8 {
        self.tcpi_wscale >> 4
    }

    pub fn sample(&self) -> TcpInfoSample {
        TcpInfoSample {
            rtt_us: u64::from(self.tcpi_rtt),
            rttvar_us: u64::from(self.tcpi_rttvar),
            rcv_rtt_us: u64::from(self.tcpi_rcv_rtt),
            rcv_wscale: self.rcv_wscale(),
            rcv_mss: self.tcpi_rcv_mss,
        }
    }
}

/// Decode the `INET_DIAG_INFO` attribute payload
pub fn parse_tcp_info(data: &[u8]) -> Result<TcpInfoBasic> {
    let size = std::mem::size_of::<TcpInfoBasic>();
    if data.len() < size {
        return Err(MonitorError::netlink(format!(
            "tcp_info too small: {} bytes (need {size})",
            data.len()
        )));
    }
    // SAFETY: length checked; TcpInfoBasic is repr(C) integers only, so any
    // bit pattern is valid, and read_unaligned copies out of the buffer.
    Ok(unsafe { std::ptr::read_unaligned(data.as_ptr().cast::<TcpInfoBasic>()) })
}
