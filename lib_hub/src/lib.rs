//! # lib_hub
//!
//! A single-process data-distribution hub. Many client ports subscribe to
//! logical data providers by `providerId`; the hub keeps at most one upstream
//! engine per provider alive, replays its cached snapshot to late joiners and
//! fans every live event out to all current subscribers.
//!
//! - [`protocol`]: the request/response envelopes.
//! - [`core`]: ports, router, engine registry, dispatcher and heartbeat sweep.
//! - [`engines`]: the engine contract plus the ready-made stream engine and adapters.

pub mod core;
pub mod engines;
pub mod error;
pub mod protocol;

pub use crate::core::{Dispatcher, HubContext, HubSettings, PortConnection};
pub use error::{HubError, HubResult};
