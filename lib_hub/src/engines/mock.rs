//! # Mock Feed
//!
//! A synthetic position feed. It streams `snapshotRows` rows in batches, marks
//! the snapshot complete, then emits one random delta every `updateIntervalMs`
//! until the engine is stopped. It exists so the hub can run end to end with
//! no upstream at all.
//!
//! Recognised options (all optional):
//!
//! | key                | default | meaning                                         |
//! |--------------------|---------|-------------------------------------------------|
//! | `snapshotRows`     | 500     | rows in the initial load                        |
//! | `batchSize`        | 100     | rows per snapshot batch                         |
//! | `batchIntervalMs`  | 10      | pause between snapshot batches                  |
//! | `updateIntervalMs` | 1000    | pause between deltas, `0` disables deltas       |
//! | `connectDelayMs`   | 0       | simulated upstream connect latency              |
//! | `failCreate`       | false   | make construction fail with an upstream error   |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};

use super::config::FeedConfig;
use super::stream::StreamEngine;
use super::{DistributionEngine, EngineError, EngineFactory, EngineSink};

const SYMBOLS: [&str; 8] = ["AAPL", "MSFT", "TSLA", "NVDA", "AMZN", "GOOG", "META", "NFLX"];

#[derive(Debug, Clone, PartialEq)]
struct MockOptions {
    snapshot_rows: u64,
    batch_size: u64,
    batch_interval: Duration,
    update_interval: Duration,
    connect_delay: Duration,
    fail_create: bool,
}

impl MockOptions {
    fn from_feed(feed: &FeedConfig) -> Self {
        Self {
            snapshot_rows: feed.option_u64("snapshotRows").unwrap_or(500),
            batch_size: feed.option_u64("batchSize").unwrap_or(100).max(1),
            batch_interval: Duration::from_millis(feed.option_u64("batchIntervalMs").unwrap_or(10)),
            update_interval: Duration::from_millis(feed.option_u64("updateIntervalMs").unwrap_or(1000)),
            connect_delay: Duration::from_millis(feed.option_u64("connectDelayMs").unwrap_or(0)),
            fail_create: feed.option_bool("failCreate").unwrap_or(false),
        }
    }
}

fn mock_row(key_column: &str, index: u64) -> Value {
    let mut rng = rand::rng();
    let mut row = json!({
        "symbol": SYMBOLS[(index as usize) % SYMBOLS.len()],
        "quantity": rng.random_range(1..=10_000),
        "price": (rng.random_range(10.0..500.0_f64) * 100.0).round() / 100.0,
        "updatedAt": chrono::Utc::now().to_rfc3339(),
    });
    row[key_column] = json!(format!("POS-{:06}", index));
    row
}

#[derive(Debug, Default, Clone)]
pub struct MockFeedFactory;

impl MockFeedFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EngineFactory for MockFeedFactory {
    async fn create(
        &self,
        provider_id: &str,
        config: &Value,
        sink: EngineSink,
    ) -> Result<Arc<dyn DistributionEngine>, EngineError> {
        let feed = FeedConfig::from_value(config)?;
        let options = MockOptions::from_feed(&feed);

        if !options.connect_delay.is_zero() {
            tokio::time::sleep(options.connect_delay).await;
        }
        if options.fail_create {
            return Err(EngineError::Upstream(format!(
                "mock upstream refused connection for {}",
                provider_id
            )));
        }

        let engine = StreamEngine::new(provider_id, &feed, sink);
        tokio::spawn(run_feed(engine.clone(), options));
        log::info!("[{}] mock feed connected", provider_id);
        Ok(engine)
    }
}

async fn run_feed(engine: Arc<StreamEngine>, options: MockOptions) {
    let cancel = engine.cancellation_token();
    let key_column = engine.key_column().to_string();

    // A batch pause precedes every batch, the first one included.
    let mut next = 0;
    while next < options.snapshot_rows {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(options.batch_interval) => {}
        }

        let end = (next + options.batch_size).min(options.snapshot_rows);
        let rows = (next..end).map(|i| mock_row(&key_column, i)).collect();
        engine.push_snapshot_rows(rows);
        next = end;
    }
    engine.complete_snapshot();

    if options.update_interval.is_zero() {
        cancel.cancelled().await;
        return;
    }

    let mut ticker = tokio::time::interval(options.update_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let index = rand::rng().random_range(0..options.snapshot_rows.max(1));
                engine.push_updates(vec![mock_row(&key_column, index)]);
            }
        }
    }
    log::debug!("[{}] mock feed finished", engine.provider_id());
}
