//! # Core Hub Module
//!
//! The moving parts of one hub instance. A client connection becomes a port,
//! its requests go through the dispatcher, engines are created on demand and
//! shared per `providerId`, and their output fans out through the router.
//!
//! ## Core Components:
//!
//! - **`ports`**: which ports exist, their outbound channels and heartbeats.
//!
//! - **`router`**: the zero-copy broadcaster from one provider to its ports,
//!   with a reverse index so a dead port can be pulled out everywhere at once.
//!
//! - **`registry`**: at most one engine per provider, with concurrent creation
//!   requests collapsed onto a single in-flight build.
//!
//! - **`dispatcher`**: request handling, reference-counted engine shutdown and
//!   the per-connection [`PortConnection`].
//!
//! - **`heartbeat`**: the periodic sweep that reaps silent ports.
//!
//! - **`context`**: [`HubContext`], the single owner of all of the above.

#![forbid(unsafe_code)]

/// Hub-wide state and liveness settings.
pub mod context;
/// Request handling and client connections.
pub mod dispatcher;
/// The dead-port sweeper task.
pub mod heartbeat;
/// Port bookkeeping and heartbeats.
pub mod ports;
/// At-most-one engine per provider.
pub mod registry;
/// Provider to port fan-out.
pub mod router;

// --- Public API Re-exports ---
pub use context::{HubContext, HubSettings, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT};
pub use dispatcher::{Dispatcher, PortConnection};
pub use heartbeat::{run_heartbeat_sweep, spawn_heartbeat_sweep};
pub use ports::{PortHealth, PortReceiver, PortRegistry, PortSender};
pub use registry::{AcquiredEngine, AttachOutcome, EngineRegistry};
pub use router::{BroadcastRouter, Departure};
