//! Periodic sweep that reaps ports which stopped talking.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::core::dispatcher::Dispatcher;

/// Runs [`Dispatcher::sweep_dead_ports`] every heartbeat interval until
/// `shutdown` fires.
pub async fn run_heartbeat_sweep(dispatcher: Dispatcher, mut shutdown: broadcast::Receiver<()>) {
    let settings = dispatcher.settings();
    let mut sweep_interval = interval(settings.heartbeat_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing can be stale yet.
    sweep_interval.tick().await;

    log::info!(
        "Heartbeat sweep running every {:?}, reaping ports silent for more than {:?}",
        settings.heartbeat_interval,
        settings.heartbeat_timeout
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Heartbeat sweep received shutdown signal.");
                break;
            }
            _ = sweep_interval.tick() => {
                let reaped = dispatcher.sweep_dead_ports().await;
                log::debug!(
                    "Heartbeat sweep done: {} reaped, {} port(s) alive",
                    reaped.len(),
                    dispatcher.context().ports.port_count()
                );
            }
        }
    }
}

/// Spawns [`run_heartbeat_sweep`] on the current runtime.
pub fn spawn_heartbeat_sweep(dispatcher: Dispatcher, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(run_heartbeat_sweep(dispatcher, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::{HubContext, HubSettings};
    use crate::engines::{DistributionEngine, EngineError, EngineFactory, EngineSink, FeedConfig, StreamEngine};
    use crate::protocol::{HubRequest, RequestKind};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct PlainFactory;

    #[async_trait]
    impl EngineFactory for PlainFactory {
        async fn create(
            &self,
            provider_id: &str,
            config: &Value,
            sink: EngineSink,
        ) -> Result<Arc<dyn DistributionEngine>, EngineError> {
            let feed = FeedConfig::from_value(config)?;
            Ok(StreamEngine::new(provider_id, &feed, sink))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_reaps_a_silent_port_and_stops_on_shutdown() {
        let settings = HubSettings::new(Duration::from_secs(30), Duration::from_secs(60));
        let dispatcher = Dispatcher::new(HubContext::new(Arc::new(PlainFactory), settings));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = dispatcher.connect(tx);
        conn.handle_request(
            HubRequest::new(RequestKind::Subscribe, "pos-1", "r1")
                .with_port("A")
                .with_config(json!({"keyColumn": "id"})),
        )
        .await;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = spawn_heartbeat_sweep(dispatcher.clone(), shutdown_rx);

        // Sweeps at 30s and 60s see the port within its timeout; the 90s sweep reaps it.
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(dispatcher.context().ports.port_count(), 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(dispatcher.context().ports.port_count(), 0);
        assert_eq!(dispatcher.context().engines.engine_count(), 0);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
