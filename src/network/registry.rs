use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::network::connection::Connection;

#[derive(Debug, Default)]
struct Slots {
    connections: HashMap<u32, Arc<Connection>>,
    /// retired indexes whose offline callback has returned
    free: BTreeSet<u32>,
    next: u32,
}

/// Open connections by index.
///
/// Indexes are handed out lowest-free-first. An index leaves the map on
/// `unregister` but only becomes allocatable again after `release`, which the
/// connection task calls once the offline callback has run.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    slots: Mutex<Slots>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an index, builds the connection for it and registers it in
    /// one step.
    pub fn register<F>(&self, make: F) -> Arc<Connection>
    where
        F: FnOnce(u32) -> Connection,
    {
        let mut slots = self.slots.lock();
        let index = match slots.free.pop_first() {
            Some(index) => index,
            None => {
                let index = slots.next;
                slots.next += 1;
                index
            }
        };
        let connection = Arc::new(make(index));
        slots.connections.insert(index, connection.clone());
        trace!("registered connection {index}");
        connection
    }

    /// Idempotent; an absent index is a no-op.
    pub fn unregister(&self, index: u32) -> Option<Arc<Connection>> {
        self.slots.lock().connections.remove(&index)
    }

    /// Makes a retired index available to later connections.
    pub fn release(&self, index: u32) {
        let mut slots = self.slots.lock();
        if !slots.connections.contains_key(&index) && index < slots.next {
            slots.free.insert(index);
        }
    }

    pub fn get(&self, index: u32) -> Option<Arc<Connection>> {
        self.slots.lock().connections.get(&index).cloned()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.slots.lock().connections.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the open connections, in index order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let slots = self.slots.lock();
        let mut connections: Vec<_> = slots.connections.values().cloned().collect();
        connections.sort_by_key(|c| c.index());
        connections
    }
}
