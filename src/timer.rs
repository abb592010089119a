//! Deferred callbacks for connections
//!
//! Every connection owns two timer slots: `Generic` drives the throttle and
//! PSM machines, `Power` holds either a sleep or a wake timer (never both).
//! Cancellation bumps the slot's generation; stale heap entries are dropped
//! when they surface, so a cancelled timer can never fire.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// ============================================================================
// CLOCKS
// ============================================================================

/// Monotonic time source
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;

    fn now_ms(&self) -> u64 {
        self.now_us() / 1000
    }
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_us.fetch_add(ms * 1000, AtomicOrdering::SeqCst);
    }

    pub fn advance_us(&self, us: u64) {
        self.now_us.fetch_add(us, AtomicOrdering::SeqCst);
    }

    pub fn set_ms(&self, ms: u64) {
        self.now_us.store(ms * 1000, AtomicOrdering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(AtomicOrdering::SeqCst)
    }
}

// ============================================================================
// TIMER KEYS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    Generic,
    Sleep,
    Wake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerSlot {
    Generic,
    Power,
}

impl TimerPurpose {
    pub const fn slot(self) -> TimerSlot {
        match self {
            TimerPurpose::Generic => TimerSlot::Generic,
            TimerPurpose::Sleep | TimerPurpose::Wake => TimerSlot::Power,
        }
    }
}

/// Reference to one armed timer; goes stale once re-armed or cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    pub connection_id: u32,
    pub purpose: TimerPurpose,
    generation: u64,
}

/// A timer that came due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub connection_id: u32,
    pub purpose: TimerPurpose,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimer {
    pub purpose: TimerPurpose,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct TimerEntry {
    deadline_ms: u64,
    connection_id: u32,
    slot: TimerSlot,
    generation: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap
        other
            .deadline_ms
            .cmp(&self.deadline_ms)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy)]
struct ArmedSlot {
    generation: u64,
    purpose: TimerPurpose,
    deadline_ms: u64,
}

#[derive(Debug, Default)]
struct WheelInner {
    heap: BinaryHeap<TimerEntry>,
    armed: HashMap<(u32, TimerSlot), ArmedSlot>,
    next_generation: u64,
}

impl WheelInner {
    fn is_live(&self, entry: &TimerEntry) -> bool {
        self.armed
            .get(&(entry.connection_id, entry.slot))
            .is_some_and(|armed| armed.generation == entry.generation)
    }

    fn next_deadline(&mut self) -> Option<u64> {
        while let Some(top) = self.heap.peek() {
            if self.is_live(top) {
                return Some(top.deadline_ms);
            }
            self.heap.pop();
        }
        None
    }
}

// ============================================================================
// TIMER WHEEL
// ============================================================================

#[derive(Debug, Default)]
pub struct TimerWheel {
    inner: Mutex<WheelInner>,
    changed: Condvar,
    shutdown: AtomicBool,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `purpose` for `connection_id` at `deadline_ms`
    ///
    /// Replaces whatever the slot held, so arming a sleep timer cancels a
    /// pending wake timer and vice versa.
    pub fn schedule(
        &self,
        connection_id: u32,
        purpose: TimerPurpose,
        deadline_ms: u64,
    ) -> TimerHandle {
        let mut inner = self.inner.lock();
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let slot = purpose.slot();
        inner.armed.insert(
            (connection_id, slot),
            ArmedSlot {
                generation,
                purpose,
                deadline_ms,
            },
        );
        inner.heap.push(TimerEntry {
            deadline_ms,
            connection_id,
            slot,
            generation,
        });
        drop(inner);

        trace!(connection_id, ?purpose, deadline_ms, "timer armed");
        self.changed.notify_all();
        TimerHandle {
            connection_id,
            purpose,
            generation,
        }
    }

    /// Cancel `handle` if it is still the armed timer of its slot
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.lock();
        let key = (handle.connection_id, handle.purpose.slot());
        match inner.armed.get(&key) {
            Some(armed) if armed.generation == handle.generation => {
                inner.armed.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel_slot(&self, connection_id: u32, slot: TimerSlot) -> bool {
        self.inner.lock().armed.remove(&(connection_id, slot)).is_some()
    }

    /// Cancel every timer of a connection; returns how many were armed
    pub fn cancel_connection(&self, connection_id: u32) -> usize {
        let mut inner = self.inner.lock();
        [TimerSlot::Generic, TimerSlot::Power]
            .into_iter()
            .filter(|slot| inner.armed.remove(&(connection_id, *slot)).is_some())
            .count()
    }

    pub fn pending(&self, connection_id: u32, slot: TimerSlot) -> Option<PendingTimer> {
        self.inner
            .lock()
            .armed
            .get(&(connection_id, slot))
            .map(|armed| PendingTimer {
                purpose: armed.purpose,
                deadline_ms: armed.deadline_ms,
            })
    }

    pub fn armed_count(&self) -> usize {
        self.inner.lock().armed.len()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.inner.lock().next_deadline()
    }

    /// Disarm and return every timer due at or before `now_ms`
    pub fn pop_expired(&self, now_ms: u64) -> Vec<Expired> {
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        while let Some(top) = inner.heap.peek() {
            if top.deadline_ms > now_ms {
                break;
            }
            let Some(entry) = inner.heap.pop() else {
                break;
            };
            let key = (entry.connection_id, entry.slot);
            let Some(armed) = inner.armed.get(&key).copied() else {
                continue;
            };
            if armed.generation != entry.generation {
                continue;
            }
            inner.armed.remove(&key);
            expired.push(Expired {
                connection_id: entry.connection_id,
                purpose: armed.purpose,
                deadline_ms: entry.deadline_ms,
            });
        }
        expired
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.heap.clear();
        inner.armed.clear();
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, AtomicOrdering::SeqCst);
        // taking the lock orders this wake-up after the driver's flag check
        let _inner = self.inner.lock();
        self.changed.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(AtomicOrdering::SeqCst)
    }
}

// ============================================================================
// DRIVER THREAD
// ============================================================================

/// Background thread that fires due timers
pub struct TimerDriver {
    wheel: Arc<TimerWheel>,
    handle: Option<JoinHandle<()>>,
}

impl TimerDriver {
    /// Spawn the driver; `on_due` runs every time a deadline passes
    pub fn spawn<F>(
        wheel: Arc<TimerWheel>,
        clock: Arc<dyn Clock>,
        on_due: F,
    ) -> std::io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let thread_wheel = Arc::clone(&wheel);
        let handle = std::thread::Builder::new()
            .name("psm-timers".to_owned())
            .spawn(move || {
                debug!("timer driver started");
                while !thread_wheel.is_shutdown() {
                    let mut inner = thread_wheel.inner.lock();
                    if thread_wheel.is_shutdown() {
                        break;
                    }
                    let now = clock.now_ms();
                    match inner.next_deadline() {
                        Some(deadline) if deadline <= now => {
                            drop(inner);
                            on_due();
                        }
                        Some(deadline) => {
                            let wait = Duration::from_millis(deadline - now);
                            thread_wheel.changed.wait_for(&mut inner, wait);
                        }
                        None => {
                            thread_wheel.changed.wait(&mut inner);
                        }
                    }
                }
                debug!("timer driver stopped");
            })?;

        Ok(Self {
            wheel,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.wheel.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_expired_in_deadline_order() {
        let wheel = TimerWheel::new();
        wheel.schedule(2000, TimerPurpose::Generic, 200);
        wheel.schedule(3000, TimerPurpose::Generic, 50);
        wheel.schedule(4000, TimerPurpose::Generic, 100);

        assert_eq!(wheel.next_deadline(), Some(50));
        let ids: Vec<_> = wheel
            .pop_expired(125)
            .into_iter()
            .map(|e| e.connection_id)
            .collect();
        assert_eq!(ids, vec![3000, 4000]);
        assert_eq!(wheel.armed_count(), 1);
    }

    #[test]
    fn test_rescheduling_replaces_slot() {
        let wheel = TimerWheel::new();
        let first = wheel.schedule(2000, TimerPurpose::Generic, 100);
        wheel.schedule(2000, TimerPurpose::Generic, 500);

        assert!(!wheel.cancel(first), "stale handle must not cancel");
        assert!(wheel.pop_expired(100).is_empty());
        assert_eq!(wheel.pop_expired(500).len(), 1);
    }

    #[test]
    fn test_sleep_and_wake_share_power_slot() {
        let wheel = TimerWheel::new();
        wheel.schedule(2000, TimerPurpose::Sleep, 100);
        wheel.schedule(2000, TimerPurpose::Wake, 300);

        let pending = wheel.pending(2000, TimerSlot::Power).unwrap();
        assert_eq!(pending.purpose, TimerPurpose::Wake);

        let expired = wheel.pop_expired(1000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].purpose, TimerPurpose::Wake);
    }

    #[test]
    fn test_cancel_connection_drops_both_slots() {
        let wheel = TimerWheel::new();
        wheel.schedule(2000, TimerPurpose::Generic, 10);
        wheel.schedule(2000, TimerPurpose::Sleep, 10);
        wheel.schedule(2001, TimerPurpose::Generic, 10);

        assert_eq!(wheel.cancel_connection(2000), 2);
        let expired = wheel.pop_expired(10);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].connection_id, 2001);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        clock.advance_ms(5);
        clock.advance_us(1500);
        assert_eq!(clock.now_us(), 6500);
        assert_eq!(clock.now_ms(), 6);
    }

    #[test]
    fn test_driver_fires_and_stops() {
        use std::sync::atomic::AtomicUsize;

        let wheel = Arc::new(TimerWheel::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let cb_wheel = Arc::clone(&wheel);
        let cb_clock = Arc::clone(&clock);
        let cb_fired = Arc::clone(&fired);
        let mut driver = TimerDriver::spawn(Arc::clone(&wheel), Arc::clone(&clock), move || {
            let n = cb_wheel.pop_expired(cb_clock.now_ms()).len();
            cb_fired.fetch_add(n, AtomicOrdering::SeqCst);
        })
        .unwrap();

        wheel.schedule(2000, TimerPurpose::Generic, clock.now_ms());
        let start = Instant::now();
        while fired.load(AtomicOrdering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(5) {
            std::thread::yield_now();
        }
        driver.stop();
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
    }
}
