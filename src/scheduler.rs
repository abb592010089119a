//! Idle/sleep scheduler
//!
//! Connections report idle/active transitions here. The radio is told it may
//! sleep only when every tracked connection is idle and none of them has a
//! wake timer about to fire.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionState, IdleState};
use crate::registry::Registry;
use crate::timer::{TimerPurpose, TimerSlot, TimerWheel};

/// Apply an idle/active signal to one connection
///
/// Returns true when the connection's idle state actually changed. Also keeps
/// the lapsed-time counters current for diagnostics.
pub fn transition(conn: &mut Connection, idle: IdleState, now_ms: u64) -> bool {
    conn.connection_time_lapsed_ms = now_ms.saturating_sub(conn.connection_start_ms);
    if conn.has_reached(ConnectionState::Psmt) {
        conn.psmt_time_lapsed_ms = now_ms.saturating_sub(conn.psmt_start_ms);
    }

    match (idle, conn.idle_state) {
        (IdleState::Idle, IdleState::NotIdle) => {
            conn.idle_state = IdleState::Idle;
            conn.sleep_timestamp_ms = now_ms;
            true
        }
        (IdleState::NotIdle, IdleState::Idle) => {
            conn.idle_state = IdleState::NotIdle;
            conn.wake_timestamp_ms = now_ms;
            conn.total_idle_time_ms += now_ms.saturating_sub(conn.sleep_timestamp_ms);
            true
        }
        _ => false,
    }
}

// ============================================================================
// RADIO
// ============================================================================

/// The wireless interface whose power state we steer
pub trait RadioControl: Send + Sync {
    fn sleep(&self, now_ms: u64);
    fn wake(&self, now_ms: u64);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RadioStats {
    pub idle: bool,
    pub total_idle_ms: u64,
    pub sleep_requests: u64,
    pub wake_requests: u64,
}

/// Software stand-in for a radio driver; only keeps accounts
#[derive(Debug, Default)]
pub struct EmulatedRadio {
    state: Mutex<(RadioStats, u64)>,
}

impl EmulatedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RadioStats {
        self.state.lock().0
    }
}

impl RadioControl for EmulatedRadio {
    fn sleep(&self, now_ms: u64) {
        let mut guard = self.state.lock();
        let (stats, since) = &mut *guard;
        if !stats.idle {
            stats.idle = true;
            stats.sleep_requests += 1;
            *since = now_ms;
        }
    }

    fn wake(&self, now_ms: u64) {
        let mut guard = self.state.lock();
        let (stats, since) = &mut *guard;
        if stats.idle {
            stats.idle = false;
            stats.wake_requests += 1;
            stats.total_idle_ms += now_ms.saturating_sub(*since);
        }
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Idle/sleep scheduler: puts the radio to sleep when every flow is idle
pub struct Scheduler {
    radio: Arc<dyn RadioControl>,
    /// A wake timer due within this many ms vetoes sleep
    lookahead_ms: u64,
}

impl Scheduler {
    /// Drive `radio`; wake timers due within `lookahead_ms` keep it awake
    pub fn new(radio: Arc<dyn RadioControl>, lookahead_ms: u64) -> Self {
        Self { radio, lookahead_ms }
    }

    /// True only if every connection is idle with no imminent wake-up
    ///
    /// Takes each record's read lock in turn, so it must be called without
    /// holding any of them.
    pub fn may_sleep(&self, registry: &Registry, timers: &TimerWheel, now_ms: u64) -> bool {
        let horizon = now_ms.saturating_add(self.lookahead_ms);
        registry.entries().iter().all(|entry| {
            if entry.read().idle_state == IdleState::NotIdle {
                return false;
            }
            !timers
                .pending(entry.connection_id, TimerSlot::Power)
                .is_some_and(|t| t.purpose == TimerPurpose::Wake && t.deadline_ms <= horizon)
        })
    }

    /// Drive the radio after a connection changed to `idle`
    pub fn on_transition(
        &self,
        registry: &Registry,
        timers: &TimerWheel,
        idle: IdleState,
        now_ms: u64,
    ) {
        match idle {
            IdleState::NotIdle => {
                trace!("radio wake requested");
                self.radio.wake(now_ms);
            }
            IdleState::Idle => {
                if self.may_sleep(registry, timers, now_ms) {
                    debug!(connections = registry.count(), "all connections idle, radio may sleep");
                    self.radio.sleep(now_ms);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_accounts_idle_time() {
        let mut conn = Connection::new(40000, ConnectionState::Established, 1452);
        assert!(transition(&mut conn, IdleState::Idle, 1000));
        assert!(!transition(&mut conn, IdleState::Idle, 1100));
        assert_eq!(conn.sleep_timestamp_ms, 1000);

        assert!(transition(&mut conn, IdleState::NotIdle, 1250));
        assert_eq!(conn.total_idle_time_ms, 250);
        assert!(!transition(&mut conn, IdleState::NotIdle, 1300));

        transition(&mut conn, IdleState::Idle, 2000);
        transition(&mut conn, IdleState::NotIdle, 2100);
        assert_eq!(conn.total_idle_time_ms, 350);
    }

    #[test]
    fn test_may_sleep_vetoed_by_active_connection() {
        let registry = Registry::new();
        let timers = TimerWheel::new();
        let scheduler = Scheduler::new(Arc::new(EmulatedRadio::new()), 3);

        assert!(scheduler.may_sleep(&registry, &timers, 0));

        let a = registry
            .insert(Connection::new(40000, ConnectionState::Established, 1452))
            .unwrap();
        let b = registry
            .insert(Connection::new(40001, ConnectionState::Established, 1452))
            .unwrap();
        transition(&mut a.write(), IdleState::Idle, 10);
        assert!(!scheduler.may_sleep(&registry, &timers, 10));

        transition(&mut b.write(), IdleState::Idle, 10);
        assert!(scheduler.may_sleep(&registry, &timers, 10));
    }

    #[test]
    fn test_imminent_wake_vetoes_sleep() {
        let registry = Registry::new();
        let timers = TimerWheel::new();
        let scheduler = Scheduler::new(Arc::new(EmulatedRadio::new()), 3);
        let entry = registry
            .insert(Connection::new(40000, ConnectionState::Established, 1452))
            .unwrap();
        transition(&mut entry.write(), IdleState::Idle, 10);

        timers.schedule(40000, TimerPurpose::Wake, 12);
        assert!(!scheduler.may_sleep(&registry, &timers, 10));

        timers.schedule(40000, TimerPurpose::Wake, 50);
        assert!(scheduler.may_sleep(&registry, &timers, 10));
    }

    #[test]
    fn test_emulated_radio_accounting() {
        let radio = Arc::new(EmulatedRadio::new());
        let registry = Registry::new();
        let timers = TimerWheel::new();
        let scheduler = Scheduler::new(radio.clone(), 3);

        scheduler.on_transition(&registry, &timers, IdleState::Idle, 100);
        scheduler.on_transition(&registry, &timers, IdleState::Idle, 120);
        scheduler.on_transition(&registry, &timers, IdleState::NotIdle, 180);
        scheduler.on_transition(&registry, &timers, IdleState::NotIdle, 190);

        let stats = radio.stats();
        assert!(!stats.idle);
        assert_eq!(stats.total_idle_ms, 80);
        assert_eq!(stats.sleep_requests, 1);
        assert_eq!(stats.wake_requests, 1);
    }
}
