//! # Subscriber Tracker
//!
//! The engine's own record of which ports are attached and whether each one
//! already received the live snapshot stream. This is deliberately separate
//! from the router's membership: the router answers "who gets the next
//! message", the tracker answers "does this port still need the cache".

use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct SubscriberTracker {
    /// port id -> received the live snapshot stream directly
    ports: HashMap<String, bool>,
}

impl SubscriberTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `port_id`. Re-registering keeps whatever the port already has.
    pub fn register(&mut self, port_id: &str, receiving_live_snapshot: bool) {
        let flag = self.ports.entry(port_id.to_string()).or_insert(false);
        *flag |= receiving_live_snapshot;
    }

    pub fn unregister(&mut self, port_id: &str) -> bool {
        self.ports.remove(port_id).is_some()
    }

    /// Flags every registered port; called whenever snapshot rows go out live.
    pub fn mark_all_live(&mut self) {
        for flag in self.ports.values_mut() {
            *flag = true;
        }
    }

    pub fn received_live_snapshot(&self, port_id: &str) -> bool {
        self.ports.get(port_id).copied().unwrap_or(false)
    }

    pub fn should_receive_cached_snapshot(&self, port_id: &str) -> bool {
        !self.received_live_snapshot(port_id)
    }

    pub fn contains(&self, port_id: &str) -> bool {
        self.ports.contains_key(port_id)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}
