// ============================================================================
// CONNECTION REGISTRY
// ============================================================================
// Owns every tracked connection. Membership changes go through the coarse
// `RwLock` around the map; field updates go through each entry's own lock.
//
// === LOCK ORDER ===
// registry map lock → entry lock. Never take the map lock while holding an
// entry lock. `for_each` clones the `Arc`s out first and releases the map
// lock before visiting, so visitors may lock entries freely.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{MonitorError, Result};
use crate::timer::TimerWheel;

/// A tracked connection plus its lock
#[derive(Debug)]
pub struct ConnectionEntry {
    pub connection_id: u32,
    record: RwLock<Connection>,
}

impl ConnectionEntry {
    fn new(conn: Connection) -> Self {
        Self {
            connection_id: conn.connection_id,
            record: RwLock::new(conn),
        }
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, Connection> {
        self.record.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Connection> {
        self.record.write()
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> Connection {
        self.record.read().clone()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    connections: RwLock<HashMap<u32, Arc<ConnectionEntry>>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `conn`; an id that is already live is rejected
    pub fn insert(&self, conn: Connection) -> Result<Arc<ConnectionEntry>> {
        let id = conn.connection_id;
        let mut connections = self.connections.write();
        if connections.contains_key(&id) {
            return Err(MonitorError::DuplicateConnection { id });
        }
        let entry = Arc::new(ConnectionEntry::new(conn));
        connections.insert(id, Arc::clone(&entry));
        debug!(connection_id = id, "connection added");
        Ok(entry)
    }

    #[must_use]
    pub fn lookup(&self, id: u32) -> Option<Arc<ConnectionEntry>> {
        self.connections.read().get(&id).cloned()
    }

    /// Stop tracking `id`, cancelling its timers first
    pub fn remove(&self, id: u32, timers: &TimerWheel) -> bool {
        let mut connections = self.connections.write();
        if !connections.contains_key(&id) {
            return false;
        }
        let cancelled = timers.cancel_connection(id);
        connections.remove(&id);
        debug!(connection_id = id, cancelled, "connection removed");
        true
    }

    /// Drop every connection; safe to call repeatedly
    pub fn remove_all(&self, timers: &TimerWheel) -> usize {
        let mut connections = self.connections.write();
        for id in connections.keys() {
            timers.cancel_connection(*id);
        }
        let removed = connections.len();
        connections.clear();
        removed
    }

    /// Visit a snapshot of the live entries, in id order
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&ConnectionEntry),
    {
        for entry in self.entries() {
            visitor(&entry);
        }
    }

    pub fn entries(&self) -> Vec<Arc<ConnectionEntry>> {
        let mut entries: Vec<_> = self.connections.read().values().cloned().collect();
        entries.sort_by_key(|e| e.connection_id);
        entries
    }

    #[must_use]
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<_> = self.connections.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::timer::{TimerPurpose, TimerSlot};

    fn conn(id: u32) -> Connection {
        Connection::new(id, ConnectionState::Synced, 1452)
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = Registry::new();
        registry.insert(conn(40000)).unwrap();

        assert_eq!(registry.count(), 1);
        let entry = registry.lookup(40000).unwrap();
        assert_eq!(entry.read().state, ConnectionState::Synced);
        assert!(registry.lookup(40001).is_none());
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let registry = Registry::new();
        registry.insert(conn(40000)).unwrap();
        let err = registry.insert(conn(40000)).unwrap_err();
        assert!(matches!(err, MonitorError::DuplicateConnection { id: 40000 }));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_remove_cancels_timers() {
        let registry = Registry::new();
        let timers = TimerWheel::new();
        registry.insert(conn(40000)).unwrap();
        timers.schedule(40000, TimerPurpose::Generic, 10);
        timers.schedule(40000, TimerPurpose::Wake, 20);

        assert!(registry.remove(40000, &timers));
        assert!(!registry.remove(40000, &timers));
        assert!(timers.pending(40000, TimerSlot::Generic).is_none());
        assert!(timers.pending(40000, TimerSlot::Power).is_none());
        assert!(timers.pop_expired(100).is_empty());
    }

    #[test]
    fn test_for_each_tolerates_removal() {
        let registry = Registry::new();
        let timers = TimerWheel::new();
        for id in [40002, 40000, 40001] {
            registry.insert(conn(id)).unwrap();
        }

        let mut seen = Vec::new();
        registry.for_each(|entry| {
            seen.push(entry.connection_id);
            registry.remove(40001, &timers);
        });
        assert_eq!(seen, vec![40000, 40001, 40002]);
        assert_eq!(registry.ids(), vec![40000, 40002]);
    }

    #[test]
    fn test_remove_all_is_idempotent() {
        let registry = Registry::new();
        let timers = TimerWheel::new();
        registry.insert(conn(40000)).unwrap();
        registry.insert(conn(40001)).unwrap();
        timers.schedule(40001, TimerPurpose::Generic, 5);

        assert_eq!(registry.remove_all(&timers), 2);
        assert_eq!(registry.remove_all(&timers), 0);
        assert_eq!(timers.armed_count(), 0);
    }
}
