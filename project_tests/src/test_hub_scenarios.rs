//! # Hub Scenarios
//!
//! End-to-end behaviour of one in-process hub driven by the mock feed: shared
//! engine creation, live snapshot versus cached replay, fan-out ordering,
//! reference-counted teardown and the heartbeat sweep.
//!
//! Every scenario runs on a paused clock, so feed batches, connect delays and
//! sweeps advance deterministically.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lib_hub::core::{PortReceiver, PortSender, spawn_heartbeat_sweep};
use lib_hub::engines::{AdapterCatalog, DistributionEngine, EngineError, EngineFactory, EngineSink};
use lib_hub::protocol::{HubRequest, HubResponse, RequestKind, ResponseKind};
use lib_hub::{Dispatcher, HubContext, HubSettings};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};

/// Counts constructions on top of the real adapter catalog.
struct CountingFactory {
    inner: AdapterCatalog,
    created: AtomicUsize,
}

impl CountingFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: AdapterCatalog::with_builtin_adapters(),
            created: AtomicUsize::new(0),
        })
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineFactory for CountingFactory {
    async fn create(
        &self,
        provider_id: &str,
        config: &Value,
        sink: EngineSink,
    ) -> Result<Arc<dyn DistributionEngine>, EngineError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.inner.create(provider_id, config, sink).await
    }
}

fn hub() -> (Dispatcher, Arc<CountingFactory>) {
    let factory = CountingFactory::new();
    let ctx = HubContext::new(factory.clone(), HubSettings::default());
    (Dispatcher::new(ctx), factory)
}

fn drain(rx: &mut PortReceiver) -> Vec<Arc<HubResponse>> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

async fn ask(
    dispatcher: &Dispatcher,
    request: HubRequest,
    tx: &PortSender,
    rx: &mut PortReceiver,
) -> Vec<Arc<HubResponse>> {
    dispatcher.dispatch(request, tx).await;
    drain(rx)
}

fn rows_in(responses: &[Arc<HubResponse>], kind: ResponseKind) -> usize {
    responses
        .iter()
        .filter(|r| r.r#type == kind)
        .map(|r| r.data.as_ref().map_or(0, Vec::len))
        .sum()
}

fn mock_config(rows: u64) -> Value {
    json!({
        "adapter": "mock",
        "keyColumn": "id",
        "snapshotRows": rows,
        "batchSize": 25,
        "batchIntervalMs": 10,
        "updateIntervalMs": 0,
    })
}

fn subscribe(provider: &str, request_id: &str, port: &str, config: Value) -> HubRequest {
    HubRequest::new(RequestKind::Subscribe, provider, request_id)
        .with_port(port)
        .with_config(config)
}

#[tokio::test(start_paused = true)]
async fn concurrent_subscribes_share_one_engine() {
    let (dispatcher, factory) = hub();
    let mut config = mock_config(10);
    config["connectDelayMs"] = json!(200);

    let mut tasks = Vec::new();
    for i in 0..10 {
        let dispatcher = dispatcher.clone();
        let config = config.clone();
        tasks.push(tokio::spawn(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let request = subscribe("positions", &format!("r{}", i), &format!("port-{}", i), config);
            ask(&dispatcher, request, &tx, &mut rx).await
        }));
    }

    for task in tasks {
        let replies = task.await.unwrap();
        assert_eq!(replies[0].r#type, ResponseKind::Subscribed);
    }
    assert_eq!(factory.created(), 1);
    assert_eq!(dispatcher.context().engines.engine_count(), 1);
    assert_eq!(dispatcher.context().router.subscriber_count("positions"), 10);
}

#[tokio::test(start_paused = true)]
async fn live_subscriber_and_late_joiner_see_each_row_once() {
    let (dispatcher, _) = hub();
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();

    dispatcher.dispatch(subscribe("positions", "a1", "A", mock_config(100)), &tx_a).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let live = drain(&mut rx_a);
    assert_eq!(live[0].r#type, ResponseKind::Subscribed);
    assert_eq!(rows_in(&live, ResponseKind::Snapshot), 100);
    let live_complete: Vec<_> = live
        .iter()
        .filter(|r| r.r#type == ResponseKind::SnapshotComplete)
        .collect();
    assert_eq!(live_complete.len(), 1);
    assert_eq!(live_complete[0].request_id, "live");

    // A already has every row: its explicit request is answered with nothing.
    dispatcher
        .dispatch(HubRequest::new(RequestKind::GetSnapshot, "positions", "a2").with_port("A"), &tx_a)
        .await;
    let replay = drain(&mut rx_a);
    assert_eq!(replay.len(), 2);
    assert_eq!(rows_in(&replay, ResponseKind::Snapshot), 0);
    assert_eq!(replay[1].request_id, "a2-complete");

    // B joins after the load finished and gets the whole cache once.
    dispatcher.dispatch(subscribe("positions", "b1", "B", mock_config(100)), &tx_b).await;
    dispatcher
        .dispatch(HubRequest::new(RequestKind::GetSnapshot, "positions", "b2").with_port("B"), &tx_b)
        .await;
    let joined = drain(&mut rx_b);
    let types: Vec<ResponseKind> = joined.iter().map(|r| r.r#type).collect();
    assert_eq!(
        types,
        vec![ResponseKind::Subscribed, ResponseKind::Snapshot, ResponseKind::SnapshotComplete]
    );
    assert_eq!(rows_in(&joined, ResponseKind::Snapshot), 100);
    assert_eq!(joined[1].statistics.as_ref().unwrap()["cacheSize"], 100);
}

#[tokio::test(start_paused = true)]
async fn deltas_reach_every_subscriber_in_the_same_order() {
    let (dispatcher, _) = hub();
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let mut config = mock_config(20);
    config["updateIntervalMs"] = json!(100);

    dispatcher.dispatch(subscribe("positions", "a1", "A", config.clone()), &tx_a).await;
    dispatcher.dispatch(subscribe("positions", "b1", "B", config), &tx_b).await;
    tokio::time::sleep(Duration::from_millis(1_050)).await;

    let updates = |responses: Vec<Arc<HubResponse>>| -> Vec<Value> {
        responses
            .into_iter()
            .filter(|r| r.r#type == ResponseKind::Update)
            .flat_map(|r| r.data.clone().unwrap_or_default())
            .collect()
    };
    let seen_a = updates(drain(&mut rx_a));
    let seen_b = updates(drain(&mut rx_b));
    assert!(seen_a.len() >= 5);
    assert_eq!(seen_a, seen_b);
}

#[tokio::test(start_paused = true)]
async fn last_unsubscribe_stops_the_feed() {
    let (dispatcher, factory) = hub();
    let (tx, _rx) = mpsc::unbounded_channel();
    dispatcher.dispatch(subscribe("positions", "a1", "A", mock_config(10)), &tx).await;
    dispatcher.dispatch(subscribe("positions", "b1", "B", mock_config(10)), &tx).await;

    dispatcher
        .dispatch(HubRequest::new(RequestKind::Unsubscribe, "positions", "a2").with_port("A"), &tx)
        .await;
    assert_eq!(dispatcher.context().engines.active_providers(), vec!["positions".to_string()]);

    dispatcher
        .dispatch(HubRequest::new(RequestKind::Unsubscribe, "positions", "b2").with_port("B"), &tx)
        .await;
    assert_eq!(dispatcher.context().engines.engine_count(), 0);

    // A fresh subscribe builds a fresh engine.
    dispatcher.dispatch(subscribe("positions", "c1", "C", mock_config(10)), &tx).await;
    assert_eq!(factory.created(), 2);
}

#[tokio::test(start_paused = true)]
async fn silent_port_is_reaped_by_the_sweeper() {
    let settings = HubSettings::new(Duration::from_secs(5), Duration::from_secs(10));
    let factory = CountingFactory::new();
    let dispatcher = Dispatcher::new(HubContext::new(factory, settings));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let sweeper = spawn_heartbeat_sweep(dispatcher.clone(), shutdown_rx);

    let (tx_quiet, _rx_quiet) = mpsc::unbounded_channel();
    let (tx_alive, _rx_alive) = mpsc::unbounded_channel();
    let mut quiet = dispatcher.connect(tx_quiet);
    let mut alive = dispatcher.connect(tx_alive);
    quiet.handle_request(subscribe("solo", "q1", "quiet", mock_config(10))).await;
    alive.handle_request(subscribe("kept", "k1", "alive", mock_config(10))).await;

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(3)).await;
        alive.handle_request(HubRequest::new(RequestKind::Heartbeat, "", "hb")).await;
    }

    let ctx = dispatcher.context();
    assert_eq!(ctx.ports.port_ids(), vec!["alive".to_string()]);
    assert_eq!(ctx.engines.active_providers(), vec!["kept".to_string()]);
    assert!(ctx.router.providers_for_port("quiet").is_empty());

    shutdown_tx.send(()).unwrap();
    sweeper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_creation_leaves_no_trace() {
    let (dispatcher, factory) = hub();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut failing = mock_config(10);
    failing["failCreate"] = json!(true);

    let replies = ask(&dispatcher, subscribe("positions", "r1", "A", failing), &tx, &mut rx).await;
    assert_eq!(replies[0].r#type, ResponseKind::Error);
    assert!(replies[0].error.as_deref().unwrap().contains("refused"));
    assert_eq!(dispatcher.context().engines.engine_count(), 0);
    assert_eq!(dispatcher.context().engines.pending_count(), 0);
    assert_eq!(dispatcher.context().router.subscriber_count("positions"), 0);

    let replies = ask(&dispatcher, subscribe("positions", "r2", "A", mock_config(10)), &tx, &mut rx).await;
    assert_eq!(replies[0].r#type, ResponseKind::Subscribed);
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn unknown_adapter_is_reported() {
    let (dispatcher, _) = hub();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = json!({"adapter": "stomp", "keyColumn": "id"});
    let replies = ask(&dispatcher, subscribe("positions", "r1", "A", config), &tx, &mut rx).await;
    assert_eq!(replies[0].r#type, ResponseKind::Error);
    assert!(replies[0].error.as_deref().unwrap().contains("stomp"));
}

#[tokio::test(start_paused = true)]
async fn text_frames_round_trip_through_a_connection() {
    let (dispatcher, _) = hub();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conn = dispatcher.connect(tx);

    conn.handle_text(
        &json!({
            "type": "subscribe",
            "providerId": "positions",
            "requestId": "r1",
            "config": mock_config(5),
        })
        .to_string(),
    )
    .await;
    conn.handle_text(r#"{"type":"heartbeat","providerId":"","requestId":"hb-1"}"#).await;
    conn.handle_text(r#"{"type":"reboot","providerId":"positions","requestId":"x"}"#).await;

    let frames: Vec<Value> = drain(&mut rx)
        .iter()
        .map(|r| serde_json::from_str(&r.to_json().unwrap()).unwrap())
        .collect();
    assert_eq!(frames[0]["type"], "subscribed");
    assert_eq!(frames[0]["requestId"], "r1");
    assert_eq!(frames[1]["type"], "heartbeat-ack");
    assert_eq!(frames[2]["type"], "error");
    assert!(frames[2]["error"].as_str().unwrap().contains("reboot"));

    conn.close().await;
    assert_eq!(dispatcher.context().engines.engine_count(), 0);
}

#[tokio::test]
async fn shutdown_stops_every_engine() {
    let (dispatcher, _) = hub();
    let (tx, _rx) = mpsc::unbounded_channel();
    for provider in ["p1", "p2", "p3"] {
        dispatcher.dispatch(subscribe(provider, "r", "A", mock_config(5)), &tx).await;
    }
    assert_eq!(dispatcher.context().engines.engine_count(), 3);

    dispatcher.shutdown().await;
    assert_eq!(dispatcher.context().engines.engine_count(), 0);
}
