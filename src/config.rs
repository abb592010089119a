// ============================================================================
// MONITOR CONFIGURATION
// ============================================================================
// Every tunable of the throttling state machines lives here. Defaults match
// the constants exported from lib.rs, so an empty JSON object is a valid
// configuration file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{MonitorError, Result};
use crate::{
    AGGRESSION_DENOMINATOR, AGGRESSION_NUMERATOR, BANDWIDTH_RATIO, BURST_THRESHOLD,
    CALC_FLOWRATE_WAIT_MS, CHOKE_FACTOR, DATA_THRESHOLD, DEFAULT_HTTP_PORT, DEFAULT_MSS,
    MAX_PSMT_THROUGHPUT, MIN_CONNECTION_ID, MIN_PSMT_THROUGHPUT, PACKET_COUNT_THRESHOLD,
    PLAYOUT_BUFFER_WAIT_MS, SEND_SINGLE_PACKET_MS, TRANSITION_SLEEP_TO_WAKE_MS,
    TRANSITION_WAKE_TO_SLEEP_MS,
};

/// Runtime configuration for the monitor and the daemon around it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    // === TIMER WAITS (milliseconds) ===
    /// Delay between handshake completion and the first baseline sample
    pub playout_buffer_wait_ms: u64,
    /// Length of the baseline (CalcFlowRate) measurement window
    pub calc_flowrate_wait_ms: u64,
    /// Length of the throttle-detection measurement window
    pub throttle_detection_window_ms: u64,

    // === THROTTLE DETECTION THRESHOLDS ===
    pub packet_count_threshold: u64,
    pub data_threshold: u64,
    pub bandwidth_ratio: u64,
    /// Payload size above which an unknown flow is treated as mid-burst
    pub burst_threshold: u32,

    // === PSM CYCLE ===
    pub choke_factor: u64,
    pub min_psmt_cycle_ms: u64,
    pub default_mss: u32,
    pub min_psmt_throughput: u64,
    pub max_psmt_throughput: u64,

    // === RADIO MODEL ===
    pub transition_sleep_to_wake_ms: u64,
    pub transition_wake_to_sleep_ms: u64,
    pub send_single_packet_ms: u64,
    pub aggression_numerator: u64,
    pub aggression_denominator: u64,

    // === CONNECTION LIFETIME ===
    /// Ports at or below this value are never tracked
    pub min_connection_id: u32,
    pub closed_linger_ms: u64,

    // === POLICY SWITCHES ===
    /// Skip the bandwidth-ratio comparison and throttle every eligible flow
    pub force_psm_throttling: bool,
    /// Keep sampling flows that miss the packet/data thresholds
    pub reschedule_slow_flows: bool,
    /// Never let the PSM minimum window drop below one MSS
    pub floor_psm_window_at_mss: bool,

    // === DAEMON ===
    pub http_port: u16,
    pub control_socket_path: PathBuf,
    pub packet_socket_path: Option<PathBuf>,
    pub use_tcp_info: bool,
    pub log_level: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            playout_buffer_wait_ms: PLAYOUT_BUFFER_WAIT_MS,
            calc_flowrate_wait_ms: CALC_FLOWRATE_WAIT_MS,
            throttle_detection_window_ms: CALC_FLOWRATE_WAIT_MS,
            packet_count_threshold: PACKET_COUNT_THRESHOLD,
            data_threshold: DATA_THRESHOLD,
            bandwidth_ratio: BANDWIDTH_RATIO,
            burst_threshold: BURST_THRESHOLD,
            choke_factor: CHOKE_FACTOR,
            min_psmt_cycle_ms: 100,
            default_mss: DEFAULT_MSS,
            min_psmt_throughput: MIN_PSMT_THROUGHPUT,
            max_psmt_throughput: MAX_PSMT_THROUGHPUT,
            transition_sleep_to_wake_ms: TRANSITION_SLEEP_TO_WAKE_MS,
            transition_wake_to_sleep_ms: TRANSITION_WAKE_TO_SLEEP_MS,
            send_single_packet_ms: SEND_SINGLE_PACKET_MS,
            aggression_numerator: AGGRESSION_NUMERATOR,
            aggression_denominator: AGGRESSION_DENOMINATOR,
            min_connection_id: MIN_CONNECTION_ID,
            closed_linger_ms: 2000,
            force_psm_throttling: false,
            reschedule_slow_flows: true,
            floor_psm_window_at_mss: false,
            http_port: DEFAULT_HTTP_PORT,
            control_socket_path: PathBuf::from("/tmp/psm-throttle.ctl"),
            packet_socket_path: None,
            use_tcp_info: true,
            log_level: "info".to_owned(),
        }
    }
}

impl MonitorConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.playout_buffer_wait_ms == 0
            || self.calc_flowrate_wait_ms == 0
            || self.throttle_detection_window_ms == 0
        {
            return Err(MonitorError::config("timer waits must be non-zero"));
        }
        if self.bandwidth_ratio == 0 {
            return Err(MonitorError::config("bandwidth_ratio must be positive"));
        }
        if self.min_psmt_throughput > self.max_psmt_throughput {
            return Err(MonitorError::config(format!(
                "min_psmt_throughput ({}) exceeds max_psmt_throughput ({})",
                self.min_psmt_throughput, self.max_psmt_throughput
            )));
        }
        if self.aggression_denominator == 0 {
            return Err(MonitorError::config(
                "aggression_denominator must be non-zero",
            ));
        }
        if self.default_mss == 0 {
            return Err(MonitorError::config("default_mss must be non-zero"));
        }
        if self.min_psmt_cycle_ms == 0 {
            return Err(MonitorError::config("min_psmt_cycle_ms must be non-zero"));
        }
        Ok(())
    }
}
