//! Flow-rate estimation over the baseline, throttle-detection and PSM phases

use crate::connection::Connection;

/// Bytes per second for `bytes` observed over `elapsed_ms`
///
/// Multiplies before dividing so short windows do not truncate to zero.
/// A zero-length window yields zero.
pub fn flow_rate(bytes: u64, elapsed_ms: u64) -> u64 {
    if elapsed_ms == 0 {
        return 0;
    }
    let rate = u128::from(bytes) * 1000 / u128::from(elapsed_ms);
    u64::try_from(rate).unwrap_or(u64::MAX)
}

/// Whether a flow sped up enough under detection to be worth throttling
///
/// Holds when the detection-window rate is at least `ratio` times the
/// baseline. `force` bypasses the comparison entirely.
pub fn enable_throttling(
    flow_rate_normal: u64,
    flow_rate_td: u64,
    ratio: u64,
    force: bool,
) -> bool {
    force || flow_rate_td >= flow_rate_normal.saturating_mul(ratio)
}

/// Throughput achieved under PSM as a percentage of the baseline
pub fn throughput_percent(flow_rate_psmt: u64, flow_rate_normal: u64) -> u64 {
    if flow_rate_normal == 0 {
        return 0;
    }
    let pct = u128::from(flow_rate_psmt) * 100 / u128::from(flow_rate_normal);
    u64::try_from(pct).unwrap_or(u64::MAX)
}

/// Baseline rate from the bytes counted over the baseline window
pub fn update_flow_rate_normal(conn: &mut Connection) {
    conn.flow_rate_normal = flow_rate(conn.data_arrived_normal, conn.normal_window_ms);
}

/// Detection-window rate, measured up to `now_ms`
pub fn update_flow_rate_td(conn: &mut Connection, now_ms: u64) {
    conn.flow_rate_td = flow_rate(conn.data_arrived_td, now_ms.saturating_sub(conn.td_start_ms));
}

/// Rate over the current PSM cycle, measured up to `now_ms`
pub fn update_flow_rate_psmt(conn: &mut Connection, now_ms: u64) {
    conn.flow_rate_psmt = flow_rate(
        conn.data_arrived_psmt,
        now_ms.saturating_sub(conn.psmt_start_ms),
    );
}

/// Rate of the burst that just completed
pub fn update_flow_rate_inst(conn: &mut Connection, now_ms: u64) {
    conn.flow_rate_inst = flow_rate(
        conn.data_arrived_burst,
        now_ms.saturating_sub(conn.burst_start_ms),
    );
}
