//! The state one hub instance owns, injected into its dispatcher.

use std::sync::Arc;
use std::time::Duration;

use crate::core::ports::PortRegistry;
use crate::core::registry::EngineRegistry;
use crate::core::router::BroadcastRouter;
use crate::engines::EngineFactory;

/// Default pause between two heartbeat sweeps.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Default silence after which a port is reaped: two missed sweeps, so one
/// lost heartbeat never reaps a live client.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Liveness tuning for one hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

impl HubSettings {
    /// Builds settings, raising the timeout to the interval when it is shorter
    /// (a port could otherwise be reaped between two of its own heartbeats).
    pub fn new(heartbeat_interval: Duration, heartbeat_timeout: Duration) -> Self {
        let heartbeat_interval = heartbeat_interval.max(Duration::from_millis(1));
        if heartbeat_timeout < heartbeat_interval {
            log::warn!(
                "Heartbeat timeout {:?} is shorter than the sweep interval {:?}; using the interval",
                heartbeat_timeout,
                heartbeat_interval
            );
        }
        Self {
            heartbeat_interval,
            heartbeat_timeout: heartbeat_timeout.max(heartbeat_interval),
        }
    }
}

/// # Hub Context
///
/// Everything a hub mutates, owned in one place instead of living in process
/// globals. Tests build as many isolated hubs as they like.
pub struct HubContext {
    pub ports: PortRegistry,
    pub router: Arc<BroadcastRouter>,
    pub engines: EngineRegistry,
    pub settings: HubSettings,
}

impl HubContext {
    pub fn new(factory: Arc<dyn EngineFactory>, settings: HubSettings) -> Self {
        let router = Arc::new(BroadcastRouter::new());
        Self {
            ports: PortRegistry::new(),
            engines: EngineRegistry::new(factory, Arc::clone(&router)),
            router,
            settings,
        }
    }
}
