//! # Distribution Engines
//!
//! An engine owns one live upstream connection for one `providerId` plus the
//! state derived from it: a bounded snapshot cache, running statistics, and a
//! per-port record of who already received the live snapshot stream.
//!
//! The hub only ever talks to an engine through [`DistributionEngine`] and only
//! ever builds one through an [`EngineFactory`]. How an adapter actually fetches
//! rows (STOMP, REST, sockets, ...) stays behind those two traits.
//!
//! ## Contained Modules:
//!
//! - **`cache`**: the bounded, key-deduplicated [`SnapshotCache`].
//! - **`tracker`**: the per-port [`SubscriberTracker`] used to avoid double delivery.
//! - **`stream`**: [`StreamEngine`], a ready-made engine that adapters feed rows into.
//! - **`catalog`**: [`AdapterCatalog`], picks a factory by the config's `adapter` field.
//! - **`mock`** (feature `mock`): a synthetic position feed.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::router::BroadcastRouter;
use crate::protocol::{HubResponse, ResponseKind, LIVE_REQUEST_ID};

/// The bounded, key-deduplicated snapshot cache.
pub mod cache;
/// Adapter-name based factory selection.
pub mod catalog;
/// Engine configuration blob parsing.
pub mod config;
/// Synthetic feed adapter.
#[cfg(feature = "mock")]
pub mod mock;
/// A reusable engine implementation fed by adapters.
pub mod stream;
/// Per-port live-snapshot bookkeeping.
pub mod tracker;

pub use cache::{RowKey, SnapshotCache, UpsertOutcome};
pub use catalog::AdapterCatalog;
pub use config::FeedConfig;
#[cfg(feature = "mock")]
pub use mock::MockFeedFactory;
pub use stream::StreamEngine;
pub use tracker::SubscriberTracker;

/// Faults raised while building or running an engine.
///
/// `Clone` because a single creation outcome is handed to every caller that was
/// waiting on the same in-flight creation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid engine config: {0}")]
    InvalidConfig(String),

    #[error("Unknown adapter: {0}")]
    UnknownAdapter(String),

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Engine creation aborted: {0}")]
    Aborted(String),
}

/// Where an engine is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// Connected, no rows seen yet.
    Idle,
    /// Initial load is streaming.
    Snapshot,
    /// Initial load finished; only deltas from here on.
    Realtime,
    Stopped,
}

/// # Engine Statistics
///
/// Always available, even before the first row arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatistics {
    pub mode: EngineMode,
    pub snapshot_rows_received: u64,
    pub update_rows_received: u64,
    /// Rows that could not be cached because the key column was absent.
    pub rows_without_key: u64,
    pub cache_size: usize,
    pub subscriber_count: usize,
    pub snapshot_completed_at: Option<i64>,
    pub last_update_at: Option<i64>,
}

impl EngineStatistics {
    /// Statistics of an engine that has not seen anything yet.
    pub fn idle() -> Self {
        Self {
            mode: EngineMode::Idle,
            snapshot_rows_received: 0,
            update_rows_received: 0,
            rows_without_key: 0,
            cache_size: 0,
            subscriber_count: 0,
            snapshot_completed_at: None,
            last_update_at: None,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// # Distribution Engine
///
/// The contract the hub consumes. Everything except `stop` is synchronous and
/// cheap: the hub calls these from inside request handling.
#[async_trait]
pub trait DistributionEngine: Send + Sync {
    fn provider_id(&self) -> &str;

    fn statistics(&self) -> EngineStatistics;

    /// The materialized, de-duplicated rows currently cached.
    fn snapshot_cache(&self) -> Vec<Value>;

    fn cache_size(&self) -> usize;

    /// Field used to de-duplicate rows into the cache.
    fn key_column(&self) -> &str;

    fn register_subscriber(&self, port_id: &str);

    fn unregister_subscriber(&self, port_id: &str);

    /// `false` when `port_id` already received the live snapshot stream, `true`
    /// for a late joiner that still needs the cache replayed to it.
    fn should_subscriber_receive_cached_snapshot(&self, port_id: &str) -> bool;

    /// Answers a snapshot request from `port_id`. `deliver` runs exactly once,
    /// while the engine holds off publishing, so whatever it enqueues lands
    /// ahead of every event the engine applies afterwards.
    fn deliver_snapshot(&self, port_id: &str, deliver: &mut dyn FnMut(SnapshotDelivery));

    /// Tears down the upstream connection.
    async fn stop(&self) -> Result<(), EngineError>;
}

/// What an engine hands to [`DistributionEngine::deliver_snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDelivery {
    /// `true` for a late joiner: `rows` is the whole cache. `false` when the
    /// port already received the live stream and `rows` is empty.
    pub replay: bool,
    pub rows: Vec<Value>,
    pub key_column: String,
    pub statistics: EngineStatistics,
}

/// # Engine Factory
///
/// Builds an engine for `provider_id` from its config blob. Construction may
/// open the upstream connection and therefore suspends.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        provider_id: &str,
        config: &Value,
        sink: EngineSink,
    ) -> Result<Arc<dyn DistributionEngine>, EngineError>;
}

/// Live output of an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A batch of rows from the initial load.
    SnapshotRows(Vec<Value>),
    /// The initial load is finished.
    SnapshotComplete,
    /// Post-snapshot deltas.
    Delta(Vec<Value>),
}

/// # Engine Sink
///
/// The engine's only way out: every event is wrapped into a `live` response and
/// fanned out to whichever ports the router currently lists for the provider.
#[derive(Clone)]
pub struct EngineSink {
    provider_id: String,
    router: Arc<BroadcastRouter>,
}

impl EngineSink {
    pub fn new(provider_id: &str, router: Arc<BroadcastRouter>) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            router,
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Publishes one event. Returns how many ports it was delivered to.
    pub fn publish(&self, event: EngineEvent) -> usize {
        let response = match event {
            EngineEvent::SnapshotRows(rows) => {
                HubResponse::new(ResponseKind::Snapshot, &self.provider_id, LIVE_REQUEST_ID).with_data(rows)
            }
            EngineEvent::SnapshotComplete => {
                HubResponse::new(ResponseKind::SnapshotComplete, &self.provider_id, LIVE_REQUEST_ID)
            }
            EngineEvent::Delta(rows) => {
                HubResponse::new(ResponseKind::Update, &self.provider_id, LIVE_REQUEST_ID).with_data(rows)
            }
        };
        self.router.broadcast(&self.provider_id, Arc::new(response))
    }
}
