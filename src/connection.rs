// ============================================================================
// CONNECTION RECORD
// ============================================================================
// One `Connection` per observed TCP flow, keyed by the client-side port.
// The record is plain data; locking and timer ownership live in the registry
// (`ConnectionEntry`), and the state machines in `throttle` and `monitor`
// mutate it while holding the entry's write lock.

use serde::Serialize;
use std::net::Ipv4Addr;

// ============================================================================
// LIFECYCLE ENUMS
// ============================================================================

/// Where a connection sits on the handshake → detection → verdict lattice
///
/// Ordered: a connection only ever moves to a later variant. Every variant
/// keeps the numeric code it had as a bit flag so diagnostics stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ConnectionState {
    NoConnection,
    Synced,
    Acked,
    Established,
    ThrottleDetection,
    Normal,
    Psmt,
    Closed,
    Unknown,
    Error,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 10] = [
        ConnectionState::NoConnection,
        ConnectionState::Synced,
        ConnectionState::Acked,
        ConnectionState::Established,
        ConnectionState::ThrottleDetection,
        ConnectionState::Normal,
        ConnectionState::Psmt,
        ConnectionState::Closed,
        ConnectionState::Unknown,
        ConnectionState::Error,
    ];

    pub const fn code(self) -> u16 {
        match self {
            ConnectionState::NoConnection => 0,
            ConnectionState::Synced => 1,
            ConnectionState::Acked => 2,
            ConnectionState::Established => 4,
            ConnectionState::ThrottleDetection => 8,
            ConnectionState::Normal => 16,
            ConnectionState::Psmt => 32,
            ConnectionState::Closed => 64,
            ConnectionState::Unknown => 128,
            ConnectionState::Error => 256,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ConnectionState::NoConnection => "No Connection",
            ConnectionState::Synced => "SYN Sent",
            ConnectionState::Acked => "SYN Acknowledged",
            ConnectionState::Established => "Established",
            ConnectionState::ThrottleDetection => "Throttle Detection",
            ConnectionState::Normal => "Normal Operation",
            ConnectionState::Psmt => "PSM Throttling",
            ConnectionState::Closed => "Closed",
            ConnectionState::Unknown => "Unknown",
            ConnectionState::Error => "Error",
        }
    }
}

/// Set of states a connection has passed through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateSet(u16);

impl StateSet {
    pub fn insert(&mut self, state: ConnectionState) {
        self.0 |= state.code();
    }

    pub fn contains(self, state: ConnectionState) -> bool {
        match state {
            ConnectionState::NoConnection => true,
            other => self.0 & other.code() != 0,
        }
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn iter(self) -> impl Iterator<Item = ConnectionState> {
        ConnectionState::ALL
            .into_iter()
            .filter(move |s| *s != ConnectionState::NoConnection && self.contains(*s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ChokeState {
    #[default]
    NoOp,
    CalcFlowRate,
    PreChoke,
    PostChoke,
    OpenAck,
}

impl ChokeState {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            ChokeState::NoOp => "-",
            ChokeState::CalcFlowRate => "C FR",
            ChokeState::PreChoke => "PRE",
            ChokeState::PostChoke => "POST",
            ChokeState::OpenAck => "OPEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PsmtState {
    #[default]
    None,
    InitialChoke,
    InitialWait,
    AdvertiseWindowSize,
    Choke,
    ReceivePackets,
}

impl PsmtState {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            PsmtState::None => "-",
            PsmtState::InitialChoke => "INIT CHOKE",
            PsmtState::InitialWait => "INIT WAIT",
            PsmtState::AdvertiseWindowSize => "ADV WINSIZE",
            PsmtState::Choke => "CHOKE",
            PsmtState::ReceivePackets => "RCV PKTS",
        }
    }
}

/// Burst sub-protocol layered over the TCP handshake
///
/// Strictly ordered; `Fin` is terminal and reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub enum BurstStage {
    #[default]
    NoConnection,
    Syn,
    SynAck,
    BurstEstablished,
    BurstRequest,
    BurstStart,
    Fin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum IdleState {
    #[default]
    NotIdle,
    Idle,
}

/// Which hook saw the packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    /// Value used in controller events
    pub const fn wire_value(self) -> u8 {
        match self {
            Direction::Outbound => 0,
            Direction::Inbound => 1,
        }
    }

    pub const fn opposite(self) -> Direction {
        match self {
            Direction::Outbound => Direction::Inbound,
            Direction::Inbound => Direction::Outbound,
        }
    }
}

/// Which side of the flow carries the bulk data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FlowRole {
    /// Local host requested the data; bursts arrive inbound
    #[default]
    Download,
    /// Local host is the sender; bursts leave outbound
    Upload,
}

impl FlowRole {
    pub const fn data_direction(self) -> Direction {
        match self {
            FlowRole::Download => Direction::Inbound,
            FlowRole::Upload => Direction::Outbound,
        }
    }

    pub const fn request_direction(self) -> Direction {
        self.data_direction().opposite()
    }
}

// ============================================================================
// THE RECORD
// ============================================================================

/// Per-flow bookkeeping
///
/// Times are milliseconds on the monitor's clock unless the field name says
/// otherwise. RTT values are microseconds, as tcp_info reports them.
#[derive(Debug, Clone)]
pub struct Connection {
    // === IDENTITY ===
    pub connection_id: u32,
    pub source_port: u16,
    pub dest_port: u16,
    pub source_addr: Ipv4Addr,
    pub dest_addr: Ipv4Addr,
    pub role: FlowRole,

    // === TCP PROTOCOL STATE ===
    /// Last window the local stack advertised, in bytes
    pub window_size: u32,
    /// Window saved when the global choke zeroed it, in bytes
    pub previous_window_size: u32,
    /// Shift applied to windows written on outbound packets
    pub window_scale: u8,
    pub local_wscale: Option<u8>,
    pub peer_wscale: Option<u8>,
    pub seq: u32,
    pub ack_seq: u32,
    pub mss: u32,

    // === TIMING ===
    pub srtt_us: u32,
    pub rttvar_us: u32,
    pub rcv_rtt_us: u32,
    pub syn_sent_ms: Option<u64>,
    pub connection_start_ms: u64,
    pub td_start_ms: u64,
    pub psmt_start_ms: u64,
    pub burst_start_ms: u64,
    /// Last burst packet, microseconds; feeds the event interval
    pub last_burst_us: u64,
    pub closed_at_ms: Option<u64>,

    // === LIFECYCLE ===
    pub state: ConnectionState,
    pub reached: StateSet,
    pub choke_state: ChokeState,
    pub psmt_state: PsmtState,
    pub burst_stage: BurstStage,
    pub idle_state: IdleState,
    /// Window currently forced to zero by the global choke flag
    pub chocked: bool,

    // === TRAFFIC COUNTERS ===
    pub total_packet_count: u64,
    pub temp_data_arrived: u64,
    pub data_arrived_normal: u64,
    pub normal_window_ms: u64,
    pub data_arrived_td: u64,
    pub packet_count_td: u64,
    pub data_arrived_psmt: u64,
    pub data_arrived_burst: u64,
    pub flow_rate_normal: u64,
    pub flow_rate_td: u64,
    pub flow_rate_psmt: u64,
    pub flow_rate_inst: u64,

    // === PSM WINDOW ===
    pub psmt_window_size: u32,
    pub psmt_window_size_min: u32,
    pub min_psmt_throughput: u64,
    pub max_psmt_throughput: u64,

    // === IDLE ACCOUNTING ===
    pub sleep_timestamp_ms: u64,
    pub wake_timestamp_ms: u64,
    pub total_idle_time_ms: u64,
    pub connection_time_lapsed_ms: u64,
    pub psmt_time_lapsed_ms: u64,
}

impl Connection {
    /// Fresh record in `state`, with empty counters and no PSM window
    pub fn new(connection_id: u32, state: ConnectionState, mss: u32) -> Self {
        let mut reached = StateSet::default();
        reached.insert(state);
        Self {
            connection_id,
            source_port: 0,
            dest_port: 0,
            source_addr: Ipv4Addr::UNSPECIFIED,
            dest_addr: Ipv4Addr::UNSPECIFIED,
            role: FlowRole::Download,
            window_size: 0,
            previous_window_size: 0,
            window_scale: 0,
            local_wscale: None,
            peer_wscale: None,
            seq: 0,
            ack_seq: 0,
            mss,
            srtt_us: 0,
            rttvar_us: 0,
            rcv_rtt_us: 0,
            syn_sent_ms: None,
            connection_start_ms: 0,
            td_start_ms: 0,
            psmt_start_ms: 0,
            burst_start_ms: 0,
            last_burst_us: 0,
            closed_at_ms: None,
            state,
            reached,
            choke_state: ChokeState::NoOp,
            psmt_state: PsmtState::None,
            burst_stage: BurstStage::NoConnection,
            idle_state: IdleState::NotIdle,
            chocked: false,
            total_packet_count: 0,
            temp_data_arrived: 0,
            data_arrived_normal: 0,
            normal_window_ms: 0,
            data_arrived_td: 0,
            packet_count_td: 0,
            data_arrived_psmt: 0,
            data_arrived_burst: 0,
            flow_rate_normal: 0,
            flow_rate_td: 0,
            flow_rate_psmt: 0,
            flow_rate_inst: 0,
            psmt_window_size: 0,
            psmt_window_size_min: 0,
            min_psmt_throughput: crate::MIN_PSMT_THROUGHPUT,
            max_psmt_throughput: crate::MAX_PSMT_THROUGHPUT,
            sleep_timestamp_ms: 0,
            wake_timestamp_ms: 0,
            total_idle_time_ms: 0,
            connection_time_lapsed_ms: 0,
            psmt_time_lapsed_ms: 0,
        }
    }

    /// Move forward to `state`; requests to go backwards are ignored
    ///
    /// `Normal` and `Psmt` are alternative verdicts, so neither may replace
    /// the other once reached.
    pub fn advance(&mut self, state: ConnectionState) -> bool {
        if state <= self.state {
            return false;
        }
        if self.state == ConnectionState::Normal && state == ConnectionState::Psmt {
            return false;
        }
        self.state = state;
        self.reached.insert(state);
        true
    }

    pub fn has_reached(&self, state: ConnectionState) -> bool {
        self.reached.contains(state)
    }

    pub fn is_closed(&self) -> bool {
        self.state >= ConnectionState::Closed
    }

    pub fn rtt_ms(&self) -> u64 {
        u64::from(self.srtt_us) / 1000
    }

    /// Seed RTT from a handshake sample when no kernel estimate exists yet
    pub fn record_rtt_sample(&mut self, sample_us: u32) {
        if self.srtt_us == 0 {
            self.srtt_us = sample_us;
            self.rttvar_us = sample_us / 2;
        }
    }

    /// Window scaling only applies when both SYNs carried the option
    pub fn refresh_window_scale(&mut self) {
        self.window_scale = match (self.local_wscale, self.peer_wscale) {
            (Some(local), Some(_)) => local.min(crate::packet::MAX_WINDOW_SCALE),
            _ => 0,
        };
    }

    /// Zero all per-phase counters before a new baseline measurement
    pub fn reset_counters(&mut self) {
        self.total_packet_count = 0;
        self.temp_data_arrived = 0;
        self.data_arrived_normal = 0;
        self.normal_window_ms = 0;
        self.data_arrived_td = 0;
        self.packet_count_td = 0;
        self.data_arrived_psmt = 0;
        self.data_arrived_burst = 0;
    }

    /// Count one inbound payload-carrying packet
    pub fn account_inbound(&mut self, payload: u32) {
        let bytes = u64::from(payload);
        self.total_packet_count += 1;
        self.temp_data_arrived += bytes;
        if self.state == ConnectionState::ThrottleDetection {
            self.data_arrived_td += bytes;
            self.packet_count_td += 1;
        }
        if self.state == ConnectionState::Psmt {
            self.data_arrived_psmt += bytes;
            if self.psmt_state == PsmtState::ReceivePackets {
                self.data_arrived_burst += bytes;
            }
        }
    }
}

// ============================================================================
// WINDOW ARITHMETIC
// ============================================================================

/// Bytes that can be in flight at `flow_rate` bytes/s over `rtt_ms`
///
/// `(flow_rate * rtt_ms) / 1000`, truncating, saturating at `u32::MAX`.
pub fn calculate_window_size(flow_rate: u64, rtt_ms: u64) -> u32 {
    let bytes = u128::from(flow_rate) * u128::from(rtt_ms) / 1000;
    u32::try_from(bytes).unwrap_or(u32::MAX)
}

/// Shrink by one MSS unless that would cross `min`
pub fn reduce_window_size(window: u32, mss: u32, min: u32) -> u32 {
    window
        .checked_sub(mss)
        .filter(|reduced| *reduced >= min)
        .unwrap_or(window)
}

/// Grow by one MSS, capped at what the scaled 16-bit field can carry
pub fn increase_window_size(window: u32, mss: u32, scale: u8) -> u32 {
    let max = u32::from(u16::MAX) << scale.min(crate::packet::MAX_WINDOW_SCALE);
    window.saturating_add(mss).min(max)
}
