//! # Broadcast Router
//!
//! Maps a `providerId` to the set of ports subscribed to it and fans engine
//! output out to them.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: a response is wrapped in an `Arc` once and every
//!     subscriber receives a clone of the pointer, not of the payload.
//!
//! 2.  **Membership Only**: the router never decides lifecycle. Removing the
//!     last subscriber of a provider reports a count of zero; stopping the
//!     engine is the dispatcher's call.
//!
//! 3.  **Reverse Index**: every port also maps to the providers it joined, so a
//!     dead port can be pulled out of every set in one pass.
//!
//! Each subscriber has exactly one FIFO outbound channel, so it sees events in
//! the order they were broadcast. No ordering is promised across subscribers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::ports::PortSender;
use crate::protocol::HubResponse;

#[derive(Default)]
struct RouterState {
    /// providerId -> (portId -> outbound channel)
    subscribers: HashMap<String, HashMap<String, PortSender>>,
    /// portId -> providerIds it is subscribed to
    memberships: HashMap<String, HashSet<String>>,
}

/// One provider a departing port was removed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub provider_id: String,
    /// Subscribers left for the provider after the removal.
    pub remaining: usize,
}

#[derive(Default)]
pub struct BroadcastRouter {
    state: Mutex<RouterState>,
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `port_id` to `provider_id`. Idempotent; a repeat add refreshes the
    /// stored channel. Returns `true` when the port was not yet subscribed.
    pub fn add_subscriber(&self, provider_id: &str, port_id: &str, sender: PortSender) -> bool {
        let mut state = self.state();
        let added = state
            .subscribers
            .entry(provider_id.to_string())
            .or_default()
            .insert(port_id.to_string(), sender)
            .is_none();
        state
            .memberships
            .entry(port_id.to_string())
            .or_default()
            .insert(provider_id.to_string());
        if added {
            log::debug!("Port '{}' subscribed to '{}'", port_id, provider_id);
        }
        added
    }

    /// Removes `port_id` from `provider_id` and returns how many subscribers remain.
    pub fn remove_subscriber(&self, provider_id: &str, port_id: &str) -> usize {
        let mut state = self.state();

        if let Some(providers) = state.memberships.get_mut(port_id) {
            providers.remove(provider_id);
            if providers.is_empty() {
                state.memberships.remove(port_id);
            }
        }

        let remaining = match state.subscribers.get_mut(provider_id) {
            Some(ports) => {
                ports.remove(port_id);
                ports.len()
            }
            None => 0,
        };
        if remaining == 0 {
            state.subscribers.remove(provider_id);
        }
        remaining
    }

    /// Pulls `port_id` out of every provider it joined.
    pub fn remove_port_from_all(&self, port_id: &str) -> Vec<Departure> {
        let mut state = self.state();
        let Some(providers) = state.memberships.remove(port_id) else {
            return Vec::new();
        };

        let mut departures = Vec::with_capacity(providers.len());
        for provider_id in providers {
            let remaining = match state.subscribers.get_mut(&provider_id) {
                Some(ports) => {
                    ports.remove(port_id);
                    ports.len()
                }
                None => 0,
            };
            if remaining == 0 {
                state.subscribers.remove(&provider_id);
            }
            departures.push(Departure { provider_id, remaining });
        }
        departures.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        departures
    }

    pub fn subscriber_count(&self, provider_id: &str) -> usize {
        self.state().subscribers.get(provider_id).map_or(0, HashMap::len)
    }

    pub fn is_subscribed(&self, provider_id: &str, port_id: &str) -> bool {
        self.state()
            .subscribers
            .get(provider_id)
            .is_some_and(|ports| ports.contains_key(port_id))
    }

    /// Providers `port_id` is currently subscribed to, sorted.
    pub fn providers_for_port(&self, port_id: &str) -> Vec<String> {
        let mut providers: Vec<String> = self
            .state()
            .memberships
            .get(port_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        providers.sort();
        providers
    }

    /// Sends `response` to every subscriber of `provider_id`.
    ///
    /// A failed send means the port's connection is already gone. Its
    /// membership is left in place: removal belongs to the close/sweep path,
    /// which also settles the engine's reference count.
    pub fn broadcast(&self, provider_id: &str, response: Arc<HubResponse>) -> usize {
        let state = self.state();
        let Some(ports) = state.subscribers.get(provider_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (port_id, sender) in ports {
            match sender.send(Arc::clone(&response)) {
                Ok(()) => delivered += 1,
                Err(_) => log::debug!("Port '{}' is closed; skipping broadcast for '{}'", port_id, provider_id),
            }
        }
        delivered
    }
}
