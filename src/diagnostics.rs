//! Read-only views of live connections
//!
//! # Educational Notes
//!
//! ## What This Module Does
//!
//! The diagnostics dump never hands out live records. Instead:
//! 1. The monitor takes each connection's read lock in turn
//! 2. Copies the fields worth showing into a [`ConnectionSnapshot`]
//! 3. Releases the lock before anything is formatted
//!
//! The snapshots then feed two renderers: `serde_json` for the HTTP
//! `/connections` endpoint and [`render_table`] for the plain-text one.
//!
//! ## Units
//!
//! Snapshots are in display units, not the record's internal ones:
//! - RTT and RTT variance in milliseconds (variance capped at 9999)
//! - Data and flow rates in KiB and KiB/s
//! - PSM and idle time in whole seconds
//!
//! States carry both their numeric code and their name, so a table row
//! reads as `PSM Throttling (32)` and JSON consumers can match on either.

use std::fmt::Write;
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::connection::Connection;

/// Displayed RTT variance is capped so a wild estimate cannot break columns
const RTT_VAR_DISPLAY_CAP_MS: u64 = 9999;

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Point-in-time copy of one connection, in display units
///
/// Built with `ConnectionSnapshot::from(&conn)` while the caller holds the
/// record's read lock. Holds no references into the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    /// Registry key (the flow's local port)
    pub connection_id: u32,
    /// Lifecycle state name
    pub state: &'static str,
    /// Lifecycle state code
    pub state_code: u16,
    /// Smoothed RTT in ms
    pub rtt_ms: u64,
    /// RTT variance in ms, capped for display
    pub rtt_var_ms: u64,
    /// Bytes received in the current measurement window, in KiB
    pub data_kb: u64,
    /// Baseline flow rate, KiB/s
    pub flow_rate_normal_kbps: u64,
    /// Rate seen during throttle detection, KiB/s
    pub flow_rate_td_kbps: u64,
    /// Rate over the last PSM cycle, KiB/s
    pub flow_rate_psmt_kbps: u64,
    /// Instantaneous rate, KiB/s
    pub flow_rate_inst_kbps: u64,
    pub choke_code: u8,
    pub choke_state: &'static str,
    pub psmt_code: u8,
    pub psmt_state: &'static str,
    /// Lower edge of the PSM throughput band, percent of baseline
    pub min_psmt_throughput: u64,
    /// Receive window scale learned from the handshake or tcp_info
    pub window_scale: u8,
    /// Window the PSM machine currently advertises, in bytes
    pub psmt_window_size: u32,
    /// Time spent in PSM throttling, seconds
    pub psmt_secs: u64,
    /// Time the flow has been idle, seconds
    pub idle_secs: u64,
    /// Remote address
    pub destination: Ipv4Addr,
}

impl From<&Connection> for ConnectionSnapshot {
    fn from(conn: &Connection) -> Self {
        Self {
            connection_id: conn.connection_id,
            state: conn.state.name(),
            state_code: conn.state.code(),
            rtt_ms: u64::from(conn.srtt_us) / 1000,
            rtt_var_ms: (u64::from(conn.rttvar_us) / 1000).min(RTT_VAR_DISPLAY_CAP_MS),
            data_kb: conn.temp_data_arrived / 1024,
            flow_rate_normal_kbps: conn.flow_rate_normal / 1024,
            flow_rate_td_kbps: conn.flow_rate_td / 1024,
            flow_rate_psmt_kbps: conn.flow_rate_psmt / 1024,
            flow_rate_inst_kbps: conn.flow_rate_inst / 1024,
            choke_code: conn.choke_state.code(),
            choke_state: conn.choke_state.name(),
            psmt_code: conn.psmt_state.code(),
            psmt_state: conn.psmt_state.name(),
            min_psmt_throughput: conn.min_psmt_throughput,
            window_scale: conn.window_scale,
            psmt_window_size: conn.psmt_window_size,
            psmt_secs: conn.psmt_time_lapsed_ms / 1000,
            idle_secs: conn.total_idle_time_ms / 1000,
            destination: conn.dest_addr,
        }
    }
}

// ============================================================================
// TABLE RENDERING
// ============================================================================

/// Fixed-width table, one row per connection
///
/// The header and every row share one format string, so columns line up no
/// matter how many connections are listed. An empty slice still renders the
/// header between two rules.
pub fn render_table(snapshots: &[ConnectionSnapshot]) -> String {
    let mut out = String::new();
    let rule = "=".repeat(150);

    let _ = writeln!(out, "{rule}");
    let _ = writeln!(
        out,
        concat!(
            "{:<6} {:<26} {:>6} {:>8} {:>8} ",
            "{:>6} {:>6} {:>6} {:>6}  ",
            "{:<10} {:<15} {:>5} {:>5} {:>6} {:>6}  {}",
        ),
        "ID",
        "State (code)",
        "RTT",
        "RTT Var",
        "Data",
        "FR-N",
        "FR-TD",
        "FR-PT",
        "FR-In",
        "Choke",
        "PSMT State",
        "Min T",
        "Scale",
        "PSMT",
        "Idle",
        "Destination"
    );
    let _ = writeln!(out, "{}", "-".repeat(150));

    for s in snapshots {
        let state = format!("{} ({})", s.state, s.state_code);
        let choke = format!("{}-{}", s.choke_code, s.choke_state);
        let psmt = format!("{}-{}", s.psmt_code, s.psmt_state);
        let _ = writeln!(
            out,
            concat!(
                "{:<6} {:<26} {:>6} {:>8} {:>8} ",
                "{:>6} {:>6} {:>6} {:>6}  ",
                "{:<10} {:<15} {:>5} {:>5} {:>6} {:>6}  {}",
            ),
            s.connection_id,
            state,
            s.rtt_ms,
            s.rtt_var_ms,
            s.data_kb,
            s.flow_rate_normal_kbps,
            s.flow_rate_td_kbps,
            s.flow_rate_psmt_kbps,
            s.flow_rate_inst_kbps,
            choke,
            psmt,
            s.min_psmt_throughput,
            s.window_scale,
            s.psmt_secs,
            s.idle_secs,
            s.destination
        );
    }

    let _ = writeln!(out, "{rule}");
    out
}
