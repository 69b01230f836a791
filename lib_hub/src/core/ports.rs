//! # Port Registry
//!
//! Knows which client ports exist and whether they are alive. A port is
//! registered by the first message seen on its connection, and every inbound
//! message afterwards (of any type) refreshes its heartbeat. A periodic sweep
//! reaps ports whose last heartbeat is older than the timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::HubResponse;

/// The outbound half of a port: one FIFO channel per client connection.
pub type PortSender = mpsc::UnboundedSender<Arc<HubResponse>>;

/// Receiving half matching [`PortSender`].
pub type PortReceiver = mpsc::UnboundedReceiver<Arc<HubResponse>>;

struct PortEntry {
    sender: PortSender,
    last_heartbeat: Instant,
    is_alive: bool,
}

/// Read-only view of one registered port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortHealth {
    pub last_heartbeat: Instant,
    pub is_alive: bool,
}

#[derive(Default)]
pub struct PortRegistry {
    ports: Mutex<HashMap<String, PortEntry>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn ports(&self) -> MutexGuard<'_, HashMap<String, PortEntry>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A fresh hub-assigned port id.
    pub fn assign_port_id() -> String {
        format!("port-{}", Uuid::new_v4())
    }

    /// Records traffic from `port_id`, registering it on first sight.
    /// The heartbeat never moves backwards. Returns `true` for a new port.
    pub fn touch(&self, port_id: &str, sender: &PortSender) -> bool {
        let now = Instant::now();
        let mut ports = self.ports();
        match ports.get_mut(port_id) {
            Some(entry) => {
                entry.last_heartbeat = entry.last_heartbeat.max(now);
                entry.is_alive = true;
                if entry.sender.is_closed() {
                    entry.sender = sender.clone();
                }
                false
            }
            None => {
                ports.insert(
                    port_id.to_string(),
                    PortEntry {
                        sender: sender.clone(),
                        last_heartbeat: now,
                        is_alive: true,
                    },
                );
                true
            }
        }
    }

    /// Runs `f` only while `port_id` is registered, holding the registry lock
    /// so a sweep cannot reap the port halfway through.
    pub fn if_registered<R>(&self, port_id: &str, f: impl FnOnce() -> R) -> Option<R> {
        let ports = self.ports();
        ports.contains_key(port_id).then(f)
    }

    /// Runs `f` only while `port_id` is not registered, holding the registry
    /// lock so the port cannot come back halfway through.
    pub fn unless_registered<R>(&self, port_id: &str, f: impl FnOnce() -> R) -> Option<R> {
        let ports = self.ports();
        (!ports.contains_key(port_id)).then(f)
    }

    pub fn remove(&self, port_id: &str) -> bool {
        self.ports().remove(port_id).is_some()
    }

    pub fn sender(&self, port_id: &str) -> Option<PortSender> {
        self.ports().get(port_id).map(|entry| entry.sender.clone())
    }

    pub fn health(&self, port_id: &str) -> Option<PortHealth> {
        self.ports().get(port_id).map(|entry| PortHealth {
            last_heartbeat: entry.last_heartbeat,
            is_alive: entry.is_alive,
        })
    }

    /// Declares dead and removes every port silent for longer than `timeout`
    /// as of `now`. Returns the reaped ids, sorted.
    pub fn reap_stale(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut ports = self.ports();
        let mut dead: Vec<String> = ports
            .iter_mut()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_heartbeat) > timeout)
            .map(|(port_id, entry)| {
                entry.is_alive = false;
                port_id.clone()
            })
            .collect();
        for port_id in &dead {
            ports.remove(port_id);
        }
        dead.sort();
        dead
    }

    pub fn port_count(&self) -> usize {
        self.ports().len()
    }

    pub fn port_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ports().keys().cloned().collect();
        ids.sort();
        ids
    }
}
