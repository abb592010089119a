//! The monitor engine
//!
//! Owns the registry, the timer wheel and the scheduler, and exposes the two
//! packet hooks plus the controller and diagnostics operations. Lock order is
//! registry, then one connection record, then the timer wheel. Notifications,
//! radio decisions and kernel queries all happen after the record lock is
//! released.
//!
//! # Educational Notes
//!
//! ## What This Module Does
//!
//! Every TCP packet handed to a hook goes through the same path:
//! 1. Parse the IPv4/TCP headers; anything else is accepted untouched
//! 2. Key the flow by its local port and drop ids at or below the minimum
//! 3. Find the record, or create one when the classifier says so
//! 4. Under the record's write lock: track sequence numbers, observe the
//!    handshake, classify the burst stage, rewrite the window, count bytes
//! 5. After the lock: notify the controller and drive the idle scheduler
//!
//! Timers run the other half. [`Monitor::run_due_timers`] pops every due
//! deadline and dispatches it: the generic timer steps the throttle and PSM
//! machines, and the sleep and wake timers flip the flow's idle state.
//!
//! ## Concurrency
//!
//! Hooks, timers and control requests may run on different threads at once.
//! All shared state sits behind the registry's locks or in atomics, so a
//! `Monitor` is shared as a plain `Arc<Monitor>`.
//!
//! Side effects that would take another lock (controller notifications,
//! radio transitions, tcp_info queries) are collected in a `Deferred` value
//! and carried out once the record lock is dropped.
//!
//! ## Window Rewriting
//!
//! Only outbound packets are rewritten. A flow in PSM throttling advertises
//! the smaller of the kernel's window and the PSM window; a choked flow
//! advertises zero. The global choke flag zeroes every outbound non-SYN
//! packet until it is cleared, then restores the window seen before it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, trace, warn};

use crate::classifier::{BurstView, Classification, classify};
use crate::config::MonitorConfig;
use crate::connection::{BurstStage, Connection, ConnectionState, Direction, IdleState, PsmtState};
use crate::control::{BurstEvent, BurstNotifier, ControlRequest};
use crate::diagnostics::ConnectionSnapshot;
use crate::error::{MonitorError, Result};
use crate::flow_rate::update_flow_rate_inst;
use crate::netlink::{FlowKey, TcpInfoSample, TcpInfoSource};
use crate::packet::{MAX_WINDOW_SCALE, PacketFacts, TcpPacket};
use crate::registry::{ConnectionEntry, Registry};
use crate::scheduler::{RadioControl, Scheduler, transition};
use crate::throttle::on_generic_timer;
use crate::timer::{Clock, TimerPurpose, TimerSlot, TimerWheel};

// ============================================================================
// TYPES
// ============================================================================

/// Hook result; packets are only ever rewritten, never dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Let the packet continue, possibly with a rewritten window
    Accept,
}

/// Side effects collected under a record lock, carried out after it
#[derive(Debug, Default)]
struct Deferred {
    event: Option<BurstEvent>,
    activity: Option<IdleState>,
}

/// Burst tracker and receive-window throttler for every local TCP flow
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use psm_throttle::{BurstEvent, BurstNotifier, EmulatedRadio, ManualClock};
/// # use psm_throttle::{Monitor, MonitorConfig};
/// struct Quiet;
/// impl BurstNotifier for Quiet {
///     fn notify(&self, _event: &BurstEvent) {}
/// }
///
/// let monitor = Monitor::new(
///     MonitorConfig::default(),
///     Arc::new(ManualClock::new()),
///     Arc::new(EmulatedRadio::new()),
///     Arc::new(Quiet),
/// )?;
/// let mut packet = vec![0u8; 40];
/// monitor.hook_local_in(&mut packet);
/// monitor.run_due_timers();
/// println!("{} flows tracked", monitor.dump().len());
/// # Ok::<(), psm_throttle::MonitorError>(())
/// ```
pub struct Monitor {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    registry: Registry,
    timers: Arc<TimerWheel>,
    scheduler: Scheduler,
    notifier: Arc<dyn BurstNotifier>,
    tcp_info: Option<Arc<dyn TcpInfoSource>>,
    choking: AtomicBool,
    shut_down: AtomicBool,
}

impl Monitor {
    /// Build a monitor with an empty registry and no timers armed
    ///
    /// # Errors
    ///
    /// [`MonitorError::Config`] when `config` fails validation, for example a
    /// zero aggression denominator or a minimum throughput above the maximum.
    pub fn new(
        config: MonitorConfig,
        clock: Arc<dyn Clock>,
        radio: Arc<dyn RadioControl>,
        notifier: Arc<dyn BurstNotifier>,
    ) -> Result<Self> {
        config.validate()?;
        let lookahead = config.transition_sleep_to_wake_ms;
        Ok(Self {
            config,
            clock,
            registry: Registry::new(),
            timers: Arc::new(TimerWheel::new()),
            scheduler: Scheduler::new(radio, lookahead),
            notifier,
            tcp_info: None,
            choking: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Prefer the kernel's RTT, scale and MSS over handshake measurements
    #[must_use]
    pub fn with_tcp_info(mut self, source: Arc<dyn TcpInfoSource>) -> Self {
        self.tcp_info = Some(source);
        self
    }

    /// Active configuration
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Clock every timestamp and deadline is taken from
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Live connection records
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Timer wheel, shared with the thread that waits on its deadlines
    pub fn timers(&self) -> &Arc<TimerWheel> {
        &self.timers
    }

    // ========================================================================
    // PACKET HOOKS
    // ========================================================================

    /// Inbound IPv4 packet, before local delivery
    pub fn hook_local_in(&self, packet: &mut [u8]) -> Verdict {
        self.process(packet, Direction::Inbound)
    }

    /// Outbound IPv4 packet, after routing; may have its window rewritten
    pub fn hook_local_out(&self, packet: &mut [u8]) -> Verdict {
        self.process(packet, Direction::Outbound)
    }

    fn process(&self, buf: &mut [u8], direction: Direction) -> Verdict {
        if self.shut_down.load(Ordering::Acquire) {
            return Verdict::Accept;
        }
        let mut packet = match TcpPacket::parse(buf) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(error = %e, "packet ignored");
                return Verdict::Accept;
            }
        };

        // Flows are keyed by the local port
        let local_port = match direction {
            Direction::Inbound => packet.dest_port(),
            Direction::Outbound => packet.source_port(),
        };
        let connection_id = u32::from(local_port);
        if connection_id <= self.config.min_connection_id {
            return Verdict::Accept;
        }

        let facts = packet.facts(direction);
        let now_ms = self.clock.now_ms();
        let now_us = self.clock.now_us();

        let (entry, created) = match self.registry.lookup(connection_id) {
            Some(entry) => (entry, false),
            None => match self.create(connection_id, &packet, &facts, now_ms) {
                Some(found) => found,
                None => return Verdict::Accept,
            },
        };

        let deferred = {
            let mut conn = entry.write();
            conn.seq = packet.seq();
            conn.ack_seq = packet.ack_seq();
            observe_handshake(&mut conn, &facts, now_ms);
            // The creating packet has already been classified
            let mut deferred = if created {
                Deferred::default()
            } else {
                self.classify_packet(&mut conn, &facts, now_ms, now_us)
            };
            if let Some(idle) = self.rewrite_window(&mut conn, &mut packet, &facts, now_ms) {
                deferred.activity.get_or_insert(idle);
            }
            self.account(&mut conn, &facts, now_ms);
            deferred
        };

        if let Some(event) = deferred.event {
            self.notifier.notify(&event);
        }
        if let Some(idle) = deferred.activity {
            self.apply_activity(&entry, idle, now_ms);
        }
        Verdict::Accept
    }

    /// Start tracking a flow the classifier recognises as a flow start
    ///
    /// Returns the entry and whether this call inserted it. When the other
    /// hook inserted the same id first, its record is returned with `false`
    /// so the caller classifies the packet against it.
    fn create(
        &self,
        connection_id: u32,
        packet: &TcpPacket<'_>,
        facts: &PacketFacts,
        now_ms: u64,
    ) -> Option<(Arc<ConnectionEntry>, bool)> {
        let Classification::Create { stage, state, role } =
            classify(None, facts, self.config.burst_threshold)
        else {
            trace!(connection_id, "untracked packet ignored");
            return None;
        };

        let mut conn = self.new_connection(connection_id, state, now_ms);
        conn.burst_stage = stage;
        conn.role = role;
        let (local, remote) = match facts.direction {
            Direction::Inbound => (
                (packet.dest_addr(), packet.dest_port()),
                (packet.source_addr(), packet.source_port()),
            ),
            Direction::Outbound => (
                (packet.source_addr(), packet.source_port()),
                (packet.dest_addr(), packet.dest_port()),
            ),
        };
        (conn.source_addr, conn.source_port) = local;
        (conn.dest_addr, conn.dest_port) = remote;
        if stage == BurstStage::Fin {
            conn.closed_at_ms = Some(now_ms);
        }

        match self.registry.insert(conn) {
            Ok(entry) => {
                debug!(connection_id, ?stage, ?role, "connection created");
                if stage == BurstStage::Fin {
                    self.timers.schedule(
                        connection_id,
                        TimerPurpose::Generic,
                        now_ms + self.config.closed_linger_ms,
                    );
                }
                Some((entry, true))
            }
            // Lost a race with the other hook
            Err(MonitorError::DuplicateConnection { .. }) => {
                self.registry.lookup(connection_id).map(|entry| (entry, false))
            }
            Err(e) => {
                warn!(connection_id, error = %e, "failed to track connection");
                None
            }
        }
    }

    fn new_connection(
        &self,
        connection_id: u32,
        state: ConnectionState,
        now_ms: u64,
    ) -> Connection {
        let mut conn = Connection::new(connection_id, state, self.config.default_mss);
        conn.min_psmt_throughput = self.config.min_psmt_throughput;
        conn.max_psmt_throughput = self.config.max_psmt_throughput;
        conn.connection_start_ms = now_ms;
        conn
    }

    /// Burst-stage classification for a tracked flow
    fn classify_packet(
        &self,
        conn: &mut Connection,
        facts: &PacketFacts,
        now_ms: u64,
        now_us: u64,
    ) -> Deferred {
        let mut deferred = Deferred::default();
        let view = BurstView {
            stage: conn.burst_stage,
            role: conn.role,
        };
        let Classification::Advance {
            stage,
            notice,
            established,
            closed,
            reset_timestamp,
        } = classify(Some(view), facts, self.config.burst_threshold)
        else {
            return deferred;
        };

        if stage != conn.burst_stage {
            debug!(
                connection_id = conn.connection_id,
                from = ?conn.burst_stage,
                to = ?stage,
                "burst stage changed"
            );
            conn.burst_stage = stage;
        }
        if reset_timestamp {
            conn.last_burst_us = now_us;
        }
        if established && conn.advance(ConnectionState::Established) {
            conn.connection_start_ms = now_ms;
            info!(
                connection_id = conn.connection_id,
                rtt_us = conn.srtt_us,
                "connection established"
            );
            self.timers.schedule(
                conn.connection_id,
                TimerPurpose::Generic,
                now_ms + self.config.playout_buffer_wait_ms,
            );
        }
        if closed && conn.advance(ConnectionState::Closed) {
            conn.closed_at_ms = Some(now_ms);
            debug!(connection_id = conn.connection_id, "connection closed");
            self.timers.cancel_slot(conn.connection_id, TimerSlot::Power);
            self.timers.schedule(
                conn.connection_id,
                TimerPurpose::Generic,
                now_ms + self.config.closed_linger_ms,
            );
            deferred.activity = Some(IdleState::Idle);
        }
        if let Some(notice) = notice {
            deferred.event = Some(BurstEvent {
                interval_micros: now_us.saturating_sub(conn.last_burst_us),
                is_new: notice.is_first,
                direction: notice.direction,
                connection_id: conn.connection_id,
                size: notice.size,
            });
            conn.last_burst_us = now_us;
        }
        deferred
    }

    /// Outbound window rewriting: global choke first, then the PSM cycle
    ///
    /// Returns `Idle` when a PSM window was just advertised.
    fn rewrite_window(
        &self,
        conn: &mut Connection,
        packet: &mut TcpPacket<'_>,
        facts: &PacketFacts,
        now_ms: u64,
    ) -> Option<IdleState> {
        if facts.direction != Direction::Outbound || facts.syn {
            return None;
        }
        let scale = conn.window_scale;
        conn.window_size = u32::from(facts.window) << scale;

        if self.choking.load(Ordering::Acquire) {
            if !conn.chocked {
                conn.previous_window_size = conn.window_size;
                conn.chocked = true;
            }
            write_window(conn.connection_id, packet, 0, scale);
            return None;
        }
        if conn.chocked {
            conn.chocked = false;
            write_window(conn.connection_id, packet, conn.previous_window_size, scale);
            return None;
        }

        if conn.state != ConnectionState::Psmt {
            return None;
        }
        match conn.psmt_state {
            PsmtState::InitialChoke | PsmtState::InitialWait | PsmtState::Choke => {
                write_window(conn.connection_id, packet, 0, scale);
                None
            }
            PsmtState::AdvertiseWindowSize => {
                write_window(
                    conn.connection_id,
                    packet,
                    conn.window_size.min(conn.psmt_window_size),
                    scale,
                );
                conn.psmt_state = PsmtState::ReceivePackets;
                conn.data_arrived_burst = 0;
                conn.burst_start_ms = now_ms;
                self.arm_wake(conn, now_ms);
                Some(IdleState::Idle)
            }
            PsmtState::ReceivePackets => {
                write_window(
                    conn.connection_id,
                    packet,
                    conn.window_size.min(conn.psmt_window_size),
                    scale,
                );
                None
            }
            PsmtState::None => None,
        }
    }

    /// Inbound byte accounting; ends a PSM burst once the window is filled
    fn account(&self, conn: &mut Connection, facts: &PacketFacts, now_ms: u64) {
        if facts.direction != Direction::Inbound || facts.payload_len == 0 {
            return;
        }
        conn.account_inbound(facts.payload_len);

        let burst_done = conn.state == ConnectionState::Psmt
            && conn.psmt_state == PsmtState::ReceivePackets
            && conn.data_arrived_burst >= u64::from(conn.psmt_window_size);
        if !burst_done {
            return;
        }

        conn.psmt_state = PsmtState::Choke;
        update_flow_rate_inst(conn, now_ms);
        let delay = self.config.transition_wake_to_sleep_ms + self.config.send_single_packet_ms;
        self.timers
            .schedule(conn.connection_id, TimerPurpose::Sleep, now_ms + delay);
        debug!(
            connection_id = conn.connection_id,
            bytes = conn.data_arrived_burst,
            flow_rate_inst = conn.flow_rate_inst,
            "burst received, choking"
        );
    }

    /// After advertising, the radio may rest until just before the burst lands
    fn arm_wake(&self, conn: &Connection, now_ms: u64) {
        let lead_us = u64::from(conn.rttvar_us) * self.config.aggression_numerator
            / self.config.aggression_denominator
            + self.config.transition_sleep_to_wake_ms * 1000;
        let delay_ms = u64::from(conn.srtt_us).saturating_sub(lead_us) / 1000;
        self.timers
            .schedule(conn.connection_id, TimerPurpose::Wake, now_ms + delay_ms);
        trace!(connection_id = conn.connection_id, delay_ms, "wake timer armed");
    }

    fn apply_activity(&self, entry: &ConnectionEntry, idle: IdleState, now_ms: u64) {
        let changed = transition(&mut entry.write(), idle, now_ms);
        if changed {
            self.scheduler
                .on_transition(&self.registry, &self.timers, idle, now_ms);
        }
    }

    // ========================================================================
    // TIMERS
    // ========================================================================

    /// Fire every timer that is due; returns how many fired
    ///
    /// Called by the timer driver thread, or directly by tests after
    /// advancing a `ManualClock`. Timers whose record was deleted meanwhile
    /// fire against nothing and are dropped.
    pub fn run_due_timers(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let expired = self.timers.pop_expired(now_ms);
        for timer in &expired {
            match timer.purpose {
                TimerPurpose::Generic => self.on_generic(timer.connection_id, now_ms),
                TimerPurpose::Sleep => self.on_power(timer.connection_id, IdleState::Idle, now_ms),
                TimerPurpose::Wake => {
                    self.on_power(timer.connection_id, IdleState::NotIdle, now_ms)
                }
            }
        }
        expired.len()
    }

    fn on_generic(&self, connection_id: u32, now_ms: u64) {
        let Some(entry) = self.registry.lookup(connection_id) else {
            return;
        };

        if let Some(source) = &self.tcp_info {
            let key = {
                let conn = entry.read();
                (!conn.is_closed()).then(|| flow_key(&conn))
            };
            if let Some(sample) = key.and_then(|key| source.query(&key)) {
                apply_tcp_info(&mut entry.write(), &sample);
            }
        }

        let step = on_generic_timer(&mut entry.write(), &self.config, now_ms);
        if step.reap {
            if self.registry.remove(connection_id, &self.timers) {
                debug!(connection_id, "closed connection reaped");
            }
            return;
        }
        // A connection deleted meanwhile leaves a timer that finds nothing when it fires
        if let Some(ms) = step.reschedule_in_ms {
            self.timers
                .schedule(connection_id, TimerPurpose::Generic, now_ms + ms);
        }
        if let Some(idle) = step.activity {
            self.apply_activity(&entry, idle, now_ms);
        }
    }

    fn on_power(&self, connection_id: u32, idle: IdleState, now_ms: u64) {
        if let Some(entry) = self.registry.lookup(connection_id) {
            self.apply_activity(&entry, idle, now_ms);
        }
    }

    // ========================================================================
    // CONTROL
    // ========================================================================

    /// Track `connection_id` explicitly; timers stay unarmed
    ///
    /// # Errors
    ///
    /// - [`MonitorError::InvalidConnectionId`] for ids at or below the minimum
    /// - [`MonitorError::DuplicateConnection`] when the id is already tracked
    pub fn add_connection(&self, connection_id: u32, state: ConnectionState) -> Result<()> {
        if connection_id <= self.config.min_connection_id {
            return Err(MonitorError::InvalidConnectionId {
                id: connection_id,
                min: self.config.min_connection_id,
            });
        }
        let conn = self.new_connection(connection_id, state, self.clock.now_ms());
        self.registry.insert(conn)?;
        Ok(())
    }

    /// Forget `connection_id` and cancel its timers
    ///
    /// # Errors
    ///
    /// [`MonitorError::UnknownConnection`] when nothing is tracked under the id.
    pub fn delete_connection(&self, connection_id: u32) -> Result<()> {
        if self.registry.remove(connection_id, &self.timers) {
            Ok(())
        } else {
            Err(MonitorError::UnknownConnection { id: connection_id })
        }
    }

    /// Set the global choke flag; true when the value changed
    ///
    /// Setting the current value again does nothing, so repeated requests
    /// neither re-snapshot nor re-restore any window.
    pub fn set_choking(&self, on: bool) -> bool {
        let previous = self.choking.swap(on, Ordering::AcqRel);
        if previous != on {
            info!(choking = on, "global choke toggled");
        }
        previous != on
    }

    /// Whether the global choke flag is set
    pub fn is_choking(&self) -> bool {
        self.choking.load(Ordering::Acquire)
    }

    /// Act on a controller request; registration is the channel's business
    pub fn apply_control(&self, request: ControlRequest) -> bool {
        match request {
            ControlRequest::Register => false,
            ControlRequest::ChokeOn => self.set_choking(true),
            ControlRequest::ChokeOff => self.set_choking(false),
        }
    }

    // ========================================================================
    // DIAGNOSTICS AND TEARDOWN
    // ========================================================================

    /// Snapshot of every live connection, in id order
    pub fn dump(&self) -> Vec<ConnectionSnapshot> {
        self.registry
            .entries()
            .iter()
            .map(|entry| ConnectionSnapshot::from(&*entry.read()))
            .collect()
    }

    /// Release choking, cancel every timer and forget every connection
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_choking(false);
        let removed = self.registry.remove_all(&self.timers);
        self.timers.clear();
        info!(removed, "monitor shut down");
    }

    /// Whether [`Monitor::shutdown`] has run; hooks pass packets through after it
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

/// SYN options and the handshake RTT sample
fn observe_handshake(conn: &mut Connection, facts: &PacketFacts, now_ms: u64) {
    match facts.direction {
        Direction::Outbound if facts.syn => {
            conn.local_wscale = facts.window_scale_option;
            conn.syn_sent_ms = Some(now_ms);
            conn.refresh_window_scale();
        }
        Direction::Inbound if facts.syn => {
            conn.peer_wscale = facts.window_scale_option;
            if let Some(mss) = facts.mss_option {
                conn.mss = u32::from(mss);
            }
            conn.refresh_window_scale();
            if facts.ack {
                take_rtt_sample(conn, now_ms);
            }
        }
        Direction::Inbound if facts.ack => take_rtt_sample(conn, now_ms),
        _ => {}
    }
}

fn take_rtt_sample(conn: &mut Connection, now_ms: u64) {
    if let Some(sent) = conn.syn_sent_ms.take() {
        let sample_us = now_ms.saturating_sub(sent).saturating_mul(1000);
        conn.record_rtt_sample(u32::try_from(sample_us).unwrap_or(u32::MAX));
    }
}

fn write_window(connection_id: u32, packet: &mut TcpPacket<'_>, bytes: u32, scale: u8) {
    if !packet.rewrite_window(bytes, scale) {
        trace!(connection_id, scale, "window rewrite skipped");
    }
}

fn flow_key(conn: &Connection) -> FlowKey {
    FlowKey {
        local_addr: conn.source_addr,
        local_port: conn.source_port,
        remote_addr: conn.dest_addr,
        remote_port: conn.dest_port,
    }
}

fn apply_tcp_info(conn: &mut Connection, sample: &TcpInfoSample) {
    if sample.rtt_us > 0 {
        conn.srtt_us = u32::try_from(sample.rtt_us).unwrap_or(u32::MAX);
        conn.rttvar_us = u32::try_from(sample.rttvar_us).unwrap_or(u32::MAX);
    }
    conn.rcv_rtt_us = u32::try_from(sample.rcv_rtt_us).unwrap_or(u32::MAX);
    conn.window_scale = sample.rcv_wscale.min(MAX_WINDOW_SCALE);
    if sample.rcv_mss > 0 {
        conn.mss = sample.rcv_mss;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::RecordingNotifier;
    use crate::packet::PacketBuilder;
    use crate::scheduler::EmulatedRadio;
    use crate::timer::ManualClock;

    struct Harness {
        monitor: Monitor,
        clock: Arc<ManualClock>,
        events: Arc<RecordingNotifier>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new());
        let events = Arc::new(RecordingNotifier::default());
        let monitor = Monitor::new(
            MonitorConfig::default(),
            clock.clone(),
            Arc::new(EmulatedRadio::new()),
            events.clone(),
        )
        .unwrap();
        Harness { monitor, clock, events }
    }

    #[test]
    fn test_reserved_ports_untracked() {
        let h = harness();
        let mut syn = PacketBuilder::new(80, 40000).syn().build();
        // inbound: the local port is the destination (40000) so it is tracked
        h.monitor.hook_local_in(&mut syn);
        assert_eq!(h.monitor.registry().count(), 1);

        let mut out = PacketBuilder::new(443, 50000).syn().build();
        // outbound: the local port is the source (443)
        h.monitor.hook_local_out(&mut out);
        assert_eq!(h.monitor.registry().count(), 1);
    }

    #[test]
    fn test_handshake_rtt_and_scale() {
        let h = harness();
        let mut syn = PacketBuilder::new(40000, 80).syn().wscale(7).build();
        h.monitor.hook_local_out(&mut syn);

        h.clock.advance_ms(40);
        let mut syn_ack = PacketBuilder::new(80, 40000).syn_ack().wscale(8).mss(1400).build();
        h.monitor.hook_local_in(&mut syn_ack);

        let entry = h.monitor.registry().lookup(40000).unwrap();
        let conn = entry.read();
        assert_eq!(conn.srtt_us, 40_000);
        assert_eq!(conn.rttvar_us, 20_000);
        assert_eq!(conn.window_scale, 7);
        assert_eq!(conn.mss, 1400);
        assert_eq!(conn.source_port, 40000);
        assert_eq!(conn.dest_port, 80);
    }

    #[test]
    fn test_sequence_numbers_tracked() {
        let h = harness();
        let mut syn = PacketBuilder::new(40000, 80).syn().seq(0x1234_5678).build();
        h.monitor.hook_local_out(&mut syn);
        let entry = h.monitor.registry().lookup(40000).unwrap();
        assert_eq!(entry.read().seq, 0x1234_5678);
        assert_eq!(entry.read().ack_seq, 0);

        let mut syn_ack = PacketBuilder::new(80, 40000)
            .syn_ack()
            .seq(0x0abc_0000)
            .ack_seq(0x1234_5679)
            .build();
        h.monitor.hook_local_in(&mut syn_ack);
        let mut ack = PacketBuilder::new(40000, 80)
            .seq(0x1234_5679)
            .ack_seq(0x0abc_0001)
            .build();
        h.monitor.hook_local_out(&mut ack);

        let conn = entry.read();
        assert_eq!(conn.state, ConnectionState::Established);
        assert_eq!(conn.seq, 0x1234_5679);
        assert_eq!(conn.ack_seq, 0x0abc_0001);
    }

    #[test]
    fn test_lost_insert_race_is_not_a_creation() {
        let h = harness();
        let mut syn = PacketBuilder::new(40000, 80).syn().build();
        let packet = TcpPacket::parse(&mut syn).unwrap();
        let facts = packet.facts(Direction::Outbound);
        let (first, created) = h.monitor.create(40000, &packet, &facts, 0).unwrap();
        assert!(created);

        // the inbound hook races to create the same flow
        let mut syn_ack = PacketBuilder::new(80, 40000).syn_ack().build();
        let packet = TcpPacket::parse(&mut syn_ack).unwrap();
        let facts = packet.facts(Direction::Inbound);
        let (second, created) = h.monitor.create(40000, &packet, &facts, 0).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.read().burst_stage, BurstStage::Syn);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MonitorConfig {
            aggression_denominator: 0,
            ..MonitorConfig::default()
        };
        let result = Monitor::new(
            config,
            Arc::new(ManualClock::new()),
            Arc::new(EmulatedRadio::new()),
            Arc::new(RecordingNotifier::default()),
        );
        assert!(matches!(result, Err(MonitorError::Config { .. })));
    }

    #[test]
    fn test_invalid_packet_accepted() {
        let h = harness();
        let mut garbage = vec![0x60, 0, 0, 0];
        assert_eq!(h.monitor.hook_local_in(&mut garbage), Verdict::Accept);
        assert_eq!(garbage, vec![0x60, 0, 0, 0]);
    }

    #[test]
    fn test_wake_delay_saturates() {
        let h = harness();
        h.monitor.add_connection(40000, ConnectionState::Psmt).unwrap();
        let entry = h.monitor.registry().lookup(40000).unwrap();
        {
            let mut conn = entry.write();
            conn.srtt_us = 1_000;
            conn.rttvar_us = 10_000;
        }
        h.monitor.arm_wake(&entry.read(), 500);
        let pending = h.monitor.timers().pending(40000, TimerSlot::Power).unwrap();
        assert_eq!(pending.purpose, TimerPurpose::Wake);
        assert_eq!(pending.deadline_ms, 500);
        assert!(h.events.events().is_empty());
    }
}
