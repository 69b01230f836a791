//! # Stream Engine
//!
//! A complete [`DistributionEngine`] that adapters drive from the upstream side.
//! An adapter owns the connection and calls `push_snapshot_rows`,
//! `complete_snapshot` and `push_updates`; the engine keeps the cache, the
//! statistics and the subscriber flags consistent and fans every event out
//! through its [`EngineSink`].
//!
//! All mutation happens under one lock, and events are published while that
//! lock is held, so the order in which ports see events is the order in which
//! the engine applied them to its cache.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::cache::{SnapshotCache, UpsertOutcome};
use super::config::FeedConfig;
use super::tracker::SubscriberTracker;
use super::{
    DistributionEngine, EngineError, EngineEvent, EngineMode, EngineSink, EngineStatistics, SnapshotDelivery,
};
use crate::protocol::now_millis;

struct StreamState {
    mode: EngineMode,
    cache: SnapshotCache,
    tracker: SubscriberTracker,
    snapshot_rows_received: u64,
    update_rows_received: u64,
    rows_without_key: u64,
    snapshot_completed_at: Option<i64>,
    last_update_at: Option<i64>,
}

impl StreamState {
    fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            mode: self.mode,
            snapshot_rows_received: self.snapshot_rows_received,
            update_rows_received: self.update_rows_received,
            rows_without_key: self.rows_without_key,
            cache_size: self.cache.len(),
            subscriber_count: self.tracker.len(),
            snapshot_completed_at: self.snapshot_completed_at,
            last_update_at: self.last_update_at,
        }
    }

    fn absorb(&mut self, rows: &[Value]) {
        for row in rows {
            if self.cache.upsert(row.clone()) == UpsertOutcome::MissingKey {
                self.rows_without_key += 1;
            }
        }
    }
}

pub struct StreamEngine {
    provider_id: String,
    key_column: String,
    sink: EngineSink,
    state: Mutex<StreamState>,
    cancel: CancellationToken,
}

impl StreamEngine {
    pub fn new(provider_id: &str, config: &FeedConfig, sink: EngineSink) -> Arc<Self> {
        Arc::new(Self {
            provider_id: provider_id.to_string(),
            key_column: config.key_column.clone(),
            sink,
            state: Mutex::new(StreamState {
                mode: EngineMode::Idle,
                cache: SnapshotCache::new(&config.key_column, config.cache_limit),
                tracker: SubscriberTracker::new(),
                snapshot_rows_received: 0,
                update_rows_received: 0,
                rows_without_key: 0,
                snapshot_completed_at: None,
                last_update_at: None,
            }),
            cancel: CancellationToken::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancelled when the engine stops. Adapter tasks select on it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn mode(&self) -> EngineMode {
        self.state().mode
    }

    /// Applies a batch of initial-load rows and streams them live to every
    /// subscriber, marking each of them as having received the live snapshot.
    pub fn push_snapshot_rows(&self, rows: Vec<Value>) -> usize {
        let mut state = self.state();
        if state.mode == EngineMode::Stopped {
            return 0;
        }
        if state.mode != EngineMode::Snapshot {
            log::debug!("[{}] snapshot phase started", self.provider_id);
            state.mode = EngineMode::Snapshot;
        }
        state.snapshot_rows_received += rows.len() as u64;
        state.absorb(&rows);
        state.tracker.mark_all_live();
        self.sink.publish(EngineEvent::SnapshotRows(rows))
    }

    /// Ends the initial load. Ports that join from now on are late joiners.
    pub fn complete_snapshot(&self) {
        let mut state = self.state();
        if state.mode == EngineMode::Stopped {
            return;
        }
        state.mode = EngineMode::Realtime;
        state.snapshot_completed_at = Some(now_millis());
        log::info!(
            "[{}] snapshot complete: {} rows received, {} cached",
            self.provider_id,
            state.snapshot_rows_received,
            state.cache.len()
        );
        self.sink.publish(EngineEvent::SnapshotComplete);
    }

    /// Applies post-snapshot deltas and fans them out.
    pub fn push_updates(&self, rows: Vec<Value>) -> usize {
        let mut state = self.state();
        if state.mode == EngineMode::Stopped {
            return 0;
        }
        state.update_rows_received += rows.len() as u64;
        state.last_update_at = Some(now_millis());
        state.absorb(&rows);
        self.sink.publish(EngineEvent::Delta(rows))
    }
}

#[async_trait]
impl DistributionEngine for StreamEngine {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn statistics(&self) -> EngineStatistics {
        self.state().statistics()
    }

    fn snapshot_cache(&self) -> Vec<Value> {
        self.state().cache.rows()
    }

    fn cache_size(&self) -> usize {
        self.state().cache.len()
    }

    fn key_column(&self) -> &str {
        &self.key_column
    }

    fn register_subscriber(&self, port_id: &str) {
        let mut state = self.state();
        // Joining mid-snapshot means the rest of the load arrives live.
        let live = state.mode == EngineMode::Snapshot;
        state.tracker.register(port_id, live);
    }

    fn unregister_subscriber(&self, port_id: &str) {
        self.state().tracker.unregister(port_id);
    }

    fn should_subscriber_receive_cached_snapshot(&self, port_id: &str) -> bool {
        self.state().tracker.should_receive_cached_snapshot(port_id)
    }

    fn deliver_snapshot(&self, port_id: &str, deliver: &mut dyn FnMut(SnapshotDelivery)) {
        // Held across `deliver`: no row can be published between reading the
        // cache and enqueueing it.
        let state = self.state();
        let replay = state.tracker.should_receive_cached_snapshot(port_id);
        deliver(SnapshotDelivery {
            replay,
            rows: if replay { state.cache.rows() } else { Vec::new() },
            key_column: self.key_column.clone(),
            statistics: state.statistics(),
        });
    }

    async fn stop(&self) -> Result<(), EngineError> {
        self.cancel.cancel();
        let mut state = self.state();
        if state.mode != EngineMode::Stopped {
            state.mode = EngineMode::Stopped;
            log::info!("[{}] engine stopped", self.provider_id);
        }
        Ok(())
    }
}
