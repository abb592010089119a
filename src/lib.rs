// ============================================================================
// PSM THROTTLING MONITOR
// ============================================================================
// Watches live IPv4 TCP flows, works out where each one is in its burst
// lifecycle, and reshapes the advertised receive window so the remote sender
// pauses between bursts. The pauses give the wireless radio a chance to sleep.
//
// === PIPELINE ===
// 1. Packet hooks parse the header and find (or create) the flow record
// 2. The burst classifier advances the flow and reports burst packets
// 3. Timers drive throttle detection and the PSM advertise/choke cycle
// 4. The scheduler turns per-flow idle signals into radio sleep/wake calls
//
// === LOCKING ===
// Registry map lock, then one connection record lock, then the timer wheel.
// Nothing takes the registry lock while holding a record lock.

pub mod classifier;
pub mod config;
pub mod connection;
pub mod control;
pub mod diagnostics;
pub mod error;
pub mod flow_rate;
pub mod monitor;
pub mod netlink;
pub mod packet;
pub mod registry;
pub mod scheduler;
pub mod throttle;
pub mod timer;

pub use config::MonitorConfig;
pub use connection::{
    BurstStage, ChokeState, Connection, ConnectionState, Direction, FlowRole, IdleState, PsmtState,
};
pub use control::{BurstEvent, BurstNotifier, ControlChannel, ControlRequest};
pub use diagnostics::{ConnectionSnapshot, render_table};
pub use error::{MonitorError, Result};
pub use monitor::{Monitor, Verdict};
pub use registry::Registry;
pub use scheduler::{EmulatedRadio, RadioControl, RadioStats};
pub use timer::{Clock, ManualClock, SystemClock, TimerDriver, TimerWheel};

// ============================================================================
// DEFAULTS
// ============================================================================
// Compile-time defaults for `MonitorConfig`. Times are milliseconds.

// === TIMER WAITS ===
pub const PLAYOUT_BUFFER_WAIT_MS: u64 = 5000; // handshake to first baseline sample
pub const CALC_FLOWRATE_WAIT_MS: u64 = 5000; // baseline and detection window length

// === THROTTLE DETECTION ===
pub const PACKET_COUNT_THRESHOLD: u64 = 50;
pub const DATA_THRESHOLD: u64 = 51200; // 50 KB
pub const BANDWIDTH_RATIO: u64 = 2;
pub const BURST_THRESHOLD: u32 = 10; // payload bytes that mark a late joiner

// === PSM CYCLE ===
pub const CHOKE_FACTOR: u64 = 3; // cycle length in RTTs
pub const DEFAULT_MSS: u32 = 1452;
pub const MIN_PSMT_THROUGHPUT: u64 = 95; // percent of baseline
pub const MAX_PSMT_THROUGHPUT: u64 = 97;

// === RADIO MODEL ===
pub const TRANSITION_SLEEP_TO_WAKE_MS: u64 = 3;
pub const TRANSITION_WAKE_TO_SLEEP_MS: u64 = 0;
pub const SEND_SINGLE_PACKET_MS: u64 = 1;
// Fraction of the RTT variance subtracted from the wake-up delay
pub const AGGRESSION_NUMERATOR: u64 = 2;
pub const AGGRESSION_DENOMINATOR: u64 = 4;

// === DAEMON ===
pub const MIN_CONNECTION_ID: u32 = 1024; // well-known ports are never tracked
pub const DEFAULT_HTTP_PORT: u16 = 8888;
