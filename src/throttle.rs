//! Throttle detection and the PSM window cycle
//!
//! # Educational Notes
//!
//! ## What This Module Does
//!
//! A flow is only throttled once it has proven to be a bulk transfer that
//! the radio would serve better in bursts. The generic timer walks it
//! through that decision:
//! 1. **Baseline**: count bytes and packets for `calc_flowrate_wait_ms`
//! 2. **Thresholds**: too few packets or bytes restarts the baseline
//! 3. **Detection**: measure the rate again for the detection window
//! 4. **Decision**: a rate held at `bandwidth_ratio` times the baseline
//!    enters PSM throttling; anything else leaves the flow Normal
//! 5. **PSM cycle**: advertise a window sized from the baseline rate and
//!    RTT, let one burst arrive, choke, then adapt the window
//!
//! ## Window Adaptation
//!
//! After each cycle the PSM rate is compared with the baseline as a
//! percentage. Above `max_psmt_throughput` the window shrinks by one MSS,
//! never below the starting minimum. Below `min_psmt_throughput` it grows by
//! one MSS, never beyond what the 16-bit field can carry at the flow's scale.
//!
//! ## API Design
//!
//! Everything here is a pure step over a `&mut Connection`: no locks, no
//! timers, no I/O. [`on_generic_timer`] returns a [`GenericStep`] and the
//! monitor applies it once the record lock is released, which keeps the
//! state machines testable with nothing but a record and a config.

// ============================================================================
// THROTTLE DETECTION AND PSM STATE MACHINES
// ============================================================================
// Everything the per-connection generic timer does when it fires. The caller
// holds the connection's write lock and applies the returned `GenericStep`
// (re-arming the timer, reaping, idle transitions) after releasing it.
//
// === TIMELINE ===
//   Established ──wait──▶ CalcFlowRate ──thresholds met──▶ ThrottleDetection
//        ThrottleDetection ──expiry──▶ Normal | Psmt(InitialChoke)
//        Psmt: InitialChoke/InitialWait → Advertise → {ReceivePackets, Choke} → Advertise …

use tracing::{debug, info};

use crate::config::MonitorConfig;
use crate::connection::{
    calculate_window_size, increase_window_size, reduce_window_size, ChokeState, Connection,
    ConnectionState, IdleState, PsmtState,
};
use crate::flow_rate::{
    enable_throttling, throughput_percent, update_flow_rate_normal, update_flow_rate_psmt,
    update_flow_rate_td,
};

/// What the caller must do after a generic-timer step
///
/// The default value means "nothing": no timer, no reap, no idle change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenericStep {
    /// Re-arm the generic timer this many ms from now
    pub reschedule_in_ms: Option<u64>,
    /// Remove the connection from the registry
    pub reap: bool,
    /// Idle transition to hand to the scheduler
    pub activity: Option<IdleState>,
}

impl GenericStep {
    fn after(ms: u64) -> Self {
        Self {
            reschedule_in_ms: Some(ms),
            ..Self::default()
        }
    }

    fn done() -> Self {
        Self::default()
    }
}

/// Length of one PSM advertise/receive/choke cycle
pub fn psmt_cycle_ms(conn: &Connection, config: &MonitorConfig) -> u64 {
    (config.choke_factor * conn.rtt_ms()).max(config.min_psmt_cycle_ms)
}

/// Run one generic-timer expiry for `conn`
///
/// Dispatches on the connection's lifecycle state:
/// - closed flows are reaped
/// - Established flows start or check their baseline
/// - ThrottleDetection flows get their throttling decision
/// - Psmt flows advance one step of the PSM cycle
///
/// Any other state needs no timer and returns an empty step.
pub fn on_generic_timer(conn: &mut Connection, config: &MonitorConfig, now_ms: u64) -> GenericStep {
    if conn.is_closed() {
        return GenericStep {
            reap: true,
            ..GenericStep::default()
        };
    }

    match conn.state {
        ConnectionState::Established => match conn.choke_state {
            ChokeState::NoOp => start_baseline(conn, config, now_ms),
            ChokeState::CalcFlowRate => check_thresholds(conn, config, now_ms),
            _ => GenericStep::done(),
        },
        ConnectionState::ThrottleDetection => decide_throttling(conn, config, now_ms),
        ConnectionState::Psmt => psmt_step(conn, config, now_ms),
        _ => GenericStep::done(),
    }
}

/// Reset counters and measure the baseline rate from now
fn start_baseline(conn: &mut Connection, config: &MonitorConfig, now_ms: u64) -> GenericStep {
    conn.choke_state = ChokeState::CalcFlowRate;
    conn.reset_counters();
    conn.connection_start_ms = now_ms;
    debug!(connection_id = conn.connection_id, "baseline measurement started");
    GenericStep::after(config.calc_flowrate_wait_ms)
}

/// End the baseline; enough traffic moves the flow into detection
fn check_thresholds(conn: &mut Connection, config: &MonitorConfig, now_ms: u64) -> GenericStep {
    let enough = conn.total_packet_count >= config.packet_count_threshold
        && conn.temp_data_arrived >= config.data_threshold;

    if !enough {
        debug!(
            connection_id = conn.connection_id,
            packets = conn.total_packet_count,
            bytes = conn.temp_data_arrived,
            "below detection thresholds"
        );
        if config.reschedule_slow_flows {
            return start_baseline(conn, config, now_ms);
        }
        return GenericStep::done();
    }

    conn.data_arrived_normal = conn.temp_data_arrived;
    conn.normal_window_ms = now_ms.saturating_sub(conn.connection_start_ms);
    update_flow_rate_normal(conn);

    conn.advance(ConnectionState::ThrottleDetection);
    conn.choke_state = ChokeState::PreChoke;
    conn.td_start_ms = now_ms;
    conn.data_arrived_td = 0;
    conn.packet_count_td = 0;
    info!(
        connection_id = conn.connection_id,
        flow_rate_normal = conn.flow_rate_normal,
        "throttle detection started"
    );
    GenericStep::after(config.throttle_detection_window_ms)
}

/// Compare the detection rate with the baseline and pick Normal or Psmt
fn decide_throttling(conn: &mut Connection, config: &MonitorConfig, now_ms: u64) -> GenericStep {
    conn.choke_state = ChokeState::NoOp;
    update_flow_rate_td(conn, now_ms);

    if conn.flow_rate_normal == 0 || conn.flow_rate_td == 0 {
        conn.advance(ConnectionState::Normal);
        info!(connection_id = conn.connection_id, "no traffic to throttle, flow is normal");
        return GenericStep::done();
    }

    let throttle = enable_throttling(
        conn.flow_rate_normal,
        conn.flow_rate_td,
        config.bandwidth_ratio,
        config.force_psm_throttling,
    );
    if !throttle {
        conn.advance(ConnectionState::Normal);
        info!(
            connection_id = conn.connection_id,
            flow_rate_normal = conn.flow_rate_normal,
            flow_rate_td = conn.flow_rate_td,
            "flow is normal"
        );
        return GenericStep::done();
    }

    conn.advance(ConnectionState::Psmt);
    conn.psmt_state = PsmtState::InitialChoke;
    conn.data_arrived_psmt = 0;
    conn.data_arrived_burst = 0;
    conn.psmt_start_ms = now_ms;
    let window = calculate_window_size(conn.flow_rate_normal, conn.rtt_ms());
    conn.psmt_window_size_min = if config.floor_psm_window_at_mss {
        window.max(conn.mss)
    } else {
        window
    };
    conn.psmt_window_size = conn.psmt_window_size_min;
    conn.min_psmt_throughput = config.min_psmt_throughput;
    conn.max_psmt_throughput = config.max_psmt_throughput;
    info!(
        connection_id = conn.connection_id,
        flow_rate_normal = conn.flow_rate_normal,
        flow_rate_td = conn.flow_rate_td,
        window = conn.psmt_window_size,
        forced = config.force_psm_throttling,
        "entering PSM throttling"
    );
    GenericStep::after(psmt_cycle_ms(conn, config))
}

/// One PSM cycle step; the packet path handles Advertise and ReceivePackets
fn psmt_step(conn: &mut Connection, config: &MonitorConfig, now_ms: u64) -> GenericStep {
    let cycle = psmt_cycle_ms(conn, config);
    match conn.psmt_state {
        PsmtState::InitialChoke | PsmtState::InitialWait => {
            conn.data_arrived_burst = 0;
            conn.data_arrived_psmt = 0;
            conn.psmt_start_ms = now_ms;
            conn.psmt_state = PsmtState::AdvertiseWindowSize;
            GenericStep::after(cycle)
        }
        // the packet path applies the window
        PsmtState::AdvertiseWindowSize => GenericStep::after(cycle),
        PsmtState::Choke | PsmtState::ReceivePackets => {
            update_flow_rate_psmt(conn, now_ms);
            adapt_window(conn);
            conn.data_arrived_burst = 0;
            conn.psmt_state = PsmtState::AdvertiseWindowSize;
            GenericStep {
                reschedule_in_ms: Some(cycle),
                reap: false,
                activity: Some(IdleState::NotIdle),
            }
        }
        PsmtState::None => GenericStep::done(),
    }
}

/// Nudge the PSM window toward the throughput target band
fn adapt_window(conn: &mut Connection) {
    let pct = throughput_percent(conn.flow_rate_psmt, conn.flow_rate_normal);
    let before = conn.psmt_window_size;
    if pct > conn.max_psmt_throughput {
        conn.psmt_window_size =
            reduce_window_size(conn.psmt_window_size, conn.mss, conn.psmt_window_size_min);
    } else if pct < conn.min_psmt_throughput {
        conn.psmt_window_size =
            increase_window_size(conn.psmt_window_size, conn.mss, conn.window_scale);
    }
    if before != conn.psmt_window_size {
        debug!(
            connection_id = conn.connection_id,
            throughput = pct,
            from = before,
            to = conn.psmt_window_size,
            "PSM window adjusted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established(config: &MonitorConfig) -> Connection {
        let mut conn = Connection::new(40000, ConnectionState::Synced, config.default_mss);
        conn.advance(ConnectionState::Established);
        conn
    }

    #[test]
    fn test_first_expiry_starts_baseline() {
        let config = MonitorConfig::default();
        let mut conn = established(&config);
        conn.total_packet_count = 7;

        let step = on_generic_timer(&mut conn, &config, 5000);
        assert_eq!(conn.choke_state, ChokeState::CalcFlowRate);
        assert_eq!(conn.total_packet_count, 0);
        assert_eq!(conn.connection_start_ms, 5000);
        assert_eq!(step.reschedule_in_ms, Some(5000));
    }

    #[test]
    fn test_thresholds_met_enter_detection() {
        let config = MonitorConfig::default();
        let mut conn = established(&config);
        on_generic_timer(&mut conn, &config, 5000);
        for _ in 0..60 {
            conn.account_inbound(1000);
        }

        let step = on_generic_timer(&mut conn, &config, 10_000);
        assert_eq!(conn.state, ConnectionState::ThrottleDetection);
        assert!(conn.has_reached(ConnectionState::ThrottleDetection));
        assert_eq!(conn.choke_state, ChokeState::PreChoke);
        assert_eq!(conn.td_start_ms, 10_000);
        assert_eq!(conn.flow_rate_normal, 12_000);
        assert_eq!(step.reschedule_in_ms, Some(config.throttle_detection_window_ms));
    }

    #[test]
    fn test_slow_flow_keeps_sampling() {
        let config = MonitorConfig::default();
        let mut conn = established(&config);
        on_generic_timer(&mut conn, &config, 5000);
        conn.account_inbound(100);

        let step = on_generic_timer(&mut conn, &config, 10_000);
        assert_eq!(conn.state, ConnectionState::Established);
        assert_eq!(conn.choke_state, ChokeState::CalcFlowRate);
        assert_eq!(conn.temp_data_arrived, 0);
        assert_eq!(step.reschedule_in_ms, Some(config.calc_flowrate_wait_ms));

        let stalled = MonitorConfig {
            reschedule_slow_flows: false,
            ..MonitorConfig::default()
        };
        assert_eq!(on_generic_timer(&mut conn, &stalled, 15_000).reschedule_in_ms, None);
    }

    fn in_detection(normal: u64, td_bytes: u64) -> Connection {
        let config = MonitorConfig::default();
        let mut conn = established(&config);
        conn.advance(ConnectionState::ThrottleDetection);
        conn.flow_rate_normal = normal;
        conn.td_start_ms = 10_000;
        conn.data_arrived_td = td_bytes;
        conn.srtt_us = 50_000;
        conn
    }

    #[test]
    fn test_ratio_met_enters_psmt() {
        let config = MonitorConfig::default();
        let mut conn = in_detection(102_400, 5 * 256_000);

        let step = on_generic_timer(&mut conn, &config, 15_000);
        assert_eq!(conn.flow_rate_td, 256_000);
        assert_eq!(conn.state, ConnectionState::Psmt);
        assert_eq!(conn.psmt_state, PsmtState::InitialChoke);
        assert_eq!(conn.choke_state, ChokeState::NoOp);
        assert_eq!(conn.psmt_window_size_min, 5120);
        assert_eq!(conn.psmt_window_size, conn.psmt_window_size_min);
        assert_eq!(step.reschedule_in_ms, Some(150));
    }

    #[test]
    fn test_ratio_missed_is_normal_unless_forced() {
        let config = MonitorConfig::default();
        let mut conn = in_detection(102_400, 5 * 150_000);
        let step = on_generic_timer(&mut conn, &config, 15_000);
        assert_eq!(conn.state, ConnectionState::Normal);
        assert_eq!(step.reschedule_in_ms, None);

        let forced = MonitorConfig {
            force_psm_throttling: true,
            ..MonitorConfig::default()
        };
        let mut conn = in_detection(102_400, 5 * 150_000);
        on_generic_timer(&mut conn, &forced, 15_000);
        assert_eq!(conn.state, ConnectionState::Psmt);
    }

    #[test]
    fn test_zero_rate_is_normal() {
        let config = MonitorConfig::default();
        let mut conn = in_detection(102_400, 0);
        on_generic_timer(&mut conn, &config, 15_000);
        assert_eq!(conn.state, ConnectionState::Normal);
    }

    #[test]
    fn test_min_window_is_rate_times_rtt() {
        let config = MonitorConfig::default();
        let mut conn = in_detection(12_000, 5 * 30_000);
        conn.srtt_us = 40_000;
        on_generic_timer(&mut conn, &config, 15_000);
        assert_eq!(conn.state, ConnectionState::Psmt);
        // below one MSS, but the formula stands
        assert_eq!(conn.psmt_window_size_min, 480);
        assert_eq!(conn.psmt_window_size, 480);
    }

    #[test]
    fn test_zero_rtt_window() {
        let config = MonitorConfig::default();
        let mut conn = in_detection(102_400, 5 * 256_000);
        conn.srtt_us = 0;
        let step = on_generic_timer(&mut conn, &config, 15_000);
        assert_eq!(conn.psmt_window_size_min, 0);
        assert_eq!(step.reschedule_in_ms, Some(config.min_psmt_cycle_ms));

        let floored = MonitorConfig {
            floor_psm_window_at_mss: true,
            ..MonitorConfig::default()
        };
        let mut conn = in_detection(102_400, 5 * 256_000);
        conn.srtt_us = 0;
        on_generic_timer(&mut conn, &floored, 15_000);
        assert_eq!(conn.psmt_window_size_min, 1452);
        assert_eq!(conn.psmt_window_size, 1452);
    }

    fn in_psmt(state: PsmtState) -> Connection {
        let config = MonitorConfig::default();
        let mut conn = in_detection(100_000, 0);
        conn.advance(ConnectionState::Psmt);
        conn.psmt_state = state;
        conn.psmt_window_size_min = 5000;
        conn.psmt_window_size = 8000;
        conn.mss = 1000;
        conn.min_psmt_throughput = config.min_psmt_throughput;
        conn.max_psmt_throughput = config.max_psmt_throughput;
        conn
    }

    #[test]
    fn test_initial_states_move_to_advertise() {
        let config = MonitorConfig::default();
        for state in [PsmtState::InitialChoke, PsmtState::InitialWait] {
            let mut conn = in_psmt(state);
            conn.data_arrived_burst = 99;
            on_generic_timer(&mut conn, &config, 20_000);
            assert_eq!(conn.psmt_state, PsmtState::AdvertiseWindowSize);
            assert_eq!(conn.data_arrived_burst, 0);
            assert_eq!(conn.psmt_start_ms, 20_000);
        }
    }

    #[test]
    fn test_advertise_is_idle_on_timer() {
        let config = MonitorConfig::default();
        let mut conn = in_psmt(PsmtState::AdvertiseWindowSize);
        let step = on_generic_timer(&mut conn, &config, 20_000);
        assert_eq!(conn.psmt_state, PsmtState::AdvertiseWindowSize);
        assert_eq!(conn.psmt_window_size, 8000);
        assert_eq!(step.activity, None);
    }

    #[test]
    fn test_choke_expiry_adapts_and_readvertises() {
        let config = MonitorConfig::default();

        // 100% of baseline: above the 97% ceiling, shrink
        let mut conn = in_psmt(PsmtState::Choke);
        conn.psmt_start_ms = 20_000;
        conn.data_arrived_psmt = 100_000;
        conn.data_arrived_burst = 4000;
        let step = on_generic_timer(&mut conn, &config, 21_000);
        assert_eq!(conn.psmt_window_size, 7000);
        assert_eq!(conn.psmt_state, PsmtState::AdvertiseWindowSize);
        assert_eq!(conn.data_arrived_burst, 0);
        assert_eq!(step.activity, Some(IdleState::NotIdle));

        // 50% of baseline: below the 95% floor, grow
        let mut conn = in_psmt(PsmtState::ReceivePackets);
        conn.psmt_start_ms = 20_000;
        conn.data_arrived_psmt = 50_000;
        on_generic_timer(&mut conn, &config, 21_000);
        assert_eq!(conn.psmt_window_size, 9000);

        // shrinking stops at the minimum
        let mut conn = in_psmt(PsmtState::Choke);
        conn.psmt_window_size = 5500;
        conn.psmt_start_ms = 20_000;
        conn.data_arrived_psmt = 100_000;
        on_generic_timer(&mut conn, &config, 21_000);
        assert_eq!(conn.psmt_window_size, 5500);
    }

    #[test]
    fn test_closed_connection_is_reaped() {
        let config = MonitorConfig::default();
        let mut conn = established(&config);
        conn.advance(ConnectionState::Closed);
        assert!(on_generic_timer(&mut conn, &config, 1).reap);
    }
}
