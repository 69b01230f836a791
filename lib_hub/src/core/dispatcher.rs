//! # Hub Dispatcher
//!
//! Routes every request a port sends to the registry, router and engines, and
//! turns every outcome into responses. Nothing escapes: validation failures,
//! lookup misses and engine faults all become an `error` reply or a log line,
//! so one bad provider never takes the hub down for the others.
//!
//! ## Per (provider, port) lifecycle
//!
//! `unsubscribed -> subscribing -> subscribed -> (snapshot-delivered | live-only) -> unsubscribed`
//!
//! - **subscribe**: ensure the engine, join the router and the engine's
//!   tracker, reply `subscribed` with statistics. No cached rows are pushed
//!   here; the client asks with `getSnapshot`.
//! - **getSnapshot**: empty `snapshot` when the port already got the live
//!   stream, otherwise the whole cache plus diagnostics. Always followed by
//!   one `snapshot-complete`.
//! - **unsubscribe** / close / sweep: leave router and tracker, stop the
//!   engine when nobody is left.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::time::Instant;

use crate::core::context::{HubContext, HubSettings};
use crate::core::ports::{PortRegistry, PortSender};
use crate::core::registry::AttachOutcome;
use crate::engines::{EngineError, SnapshotDelivery};
use crate::error::{HubError, HubResult};
use crate::protocol::{complete_request_id, HubRequest, HubResponse, RequestKind, ResponseKind};

/// How often `subscribe` retries when its engine is stopped between creation
/// and attachment.
const SUBSCRIBE_ATTEMPTS: usize = 3;

fn send(reply: &PortSender, response: HubResponse) {
    if reply.send(Arc::new(response)).is_err() {
        log::debug!("Port closed before its reply could be delivered");
    }
}

fn require_port(request: &HubRequest) -> HubResult<&str> {
    request
        .port_id
        .as_deref()
        .filter(|port_id| !port_id.is_empty())
        .ok_or(HubError::MissingField("portId"))
}

fn require_provider(request: &HubRequest) -> HubResult<&str> {
    match request.provider_id.as_str() {
        "" => Err(HubError::MissingField("providerId")),
        provider_id => Ok(provider_id),
    }
}

/// The `snapshot` reply for one delivery: cached rows plus diagnostics for a
/// late joiner, an empty batch for a port that already had the live stream.
fn snapshot_reply(request: &HubRequest, port_id: &str, delivery: SnapshotDelivery) -> HubResponse {
    let provider_id = &request.provider_id;
    if !delivery.replay {
        log::debug!("Port '{}' already has the live snapshot of '{}'", port_id, provider_id);
        return HubResponse::reply(ResponseKind::Snapshot, request).with_data(Vec::new());
    }

    let statistics = delivery.statistics;
    let mut diagnostics = json!({
        "cacheSize": delivery.rows.len(),
        "snapshotRowsReceived": statistics.snapshot_rows_received,
        "keyColumn": delivery.key_column,
        "mode": statistics.mode,
    });
    if delivery.rows.is_empty() && statistics.snapshot_rows_received > 0 {
        let warning = format!(
            "Snapshot cache is empty although {} rows were received; check that rows carry the key column '{}'",
            statistics.snapshot_rows_received, delivery.key_column
        );
        log::warn!("[{}] {}", provider_id, warning);
        diagnostics["warning"] = Value::String(warning);
    }

    log::debug!(
        "Sending {} cached rows of '{}' to port '{}'",
        delivery.rows.len(),
        provider_id,
        port_id
    );
    HubResponse::reply(ResponseKind::Snapshot, request)
        .with_data(delivery.rows)
        .with_statistics(diagnostics)
}

#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<HubContext>,
}

impl Dispatcher {
    pub fn new(ctx: HubContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &HubContext {
        &self.ctx
    }

    pub fn settings(&self) -> HubSettings {
        self.ctx.settings
    }

    /// Opens a new client connection whose replies go to `sender`.
    pub fn connect(&self, sender: PortSender) -> PortConnection {
        PortConnection {
            dispatcher: self.clone(),
            sender,
            port_id: None,
        }
    }

    /// Handles one request and delivers every response to `reply`, in order.
    /// A request naming a port counts as that port's heartbeat, and `reply` is
    /// the channel a successful `subscribe` registers for fan-out.
    pub async fn dispatch(&self, request: HubRequest, reply: &PortSender) {
        if let Some(port_id) = request.port_id.as_deref().filter(|port_id| !port_id.is_empty()) {
            if self.ctx.ports.touch(port_id, reply) {
                log::info!("Port '{}' registered", port_id);
            }
        }

        let outcome = match request.kind() {
            Some(RequestKind::Subscribe) => self.subscribe(&request, reply).await,
            Some(RequestKind::Unsubscribe) => self.unsubscribe(&request, reply).await,
            Some(RequestKind::GetSnapshot) => self.get_snapshot(&request, reply),
            Some(RequestKind::GetStatus) => self.get_status(&request, reply),
            Some(RequestKind::Heartbeat) => {
                send(reply, HubResponse::reply(ResponseKind::HeartbeatAck, &request));
                Ok(())
            }
            None => Err(HubError::UnknownRequestType(request.r#type.clone())),
        };

        if let Err(err) = outcome {
            log::warn!(
                "Request '{}' ({}) for provider '{}' failed: {}",
                request.r#type,
                request.request_id,
                request.provider_id,
                err
            );
            send(reply, HubResponse::error(&request, &err));
        }
    }

    async fn subscribe(&self, request: &HubRequest, reply: &PortSender) -> HubResult<()> {
        let port_id = require_port(request)?;
        let provider_id = require_provider(request)?;
        let config = request.config.as_ref().ok_or(HubError::MissingField("config"))?;

        for _ in 0..SUBSCRIBE_ATTEMPTS {
            let acquired = self.ctx.engines.get_or_create(provider_id, config).await?;
            let outcome = self.ctx.engines.attach(
                &self.ctx.ports,
                provider_id,
                acquired.generation,
                port_id,
                reply.clone(),
            );
            match outcome {
                AttachOutcome::Attached => {
                    log::info!("Port '{}' subscribed to provider '{}'", port_id, provider_id);
                    let mut statistics = acquired.engine.statistics().to_value();
                    if acquired.config_mismatch {
                        statistics["configMismatch"] = json!(true);
                    }
                    send(
                        reply,
                        HubResponse::reply(ResponseKind::Subscribed, request).with_statistics(statistics),
                    );
                    return Ok(());
                }
                AttachOutcome::PortGone => {
                    // Reaped while the engine was being built; undo the build
                    // unless someone else joined it meanwhile.
                    if self.ctx.engines.stop_if_unreferenced(provider_id).await {
                        log::info!("Provider '{}' has no subscribers left; engine stopped", provider_id);
                    }
                    return Err(HubError::PortExpired(port_id.to_string()));
                }
                AttachOutcome::EngineGone => log::debug!(
                    "Engine for provider '{}' stopped while port '{}' was subscribing; retrying",
                    provider_id,
                    port_id
                ),
            }
        }

        Err(HubError::Engine(EngineError::Aborted(format!(
            "engine for '{}' kept stopping while subscribing",
            provider_id
        ))))
    }

    /// Both replies are enqueued from inside the engine's delivery, so no live
    /// event can slip in between the cache read and the `snapshot-complete`.
    fn get_snapshot(&self, request: &HubRequest, reply: &PortSender) -> HubResult<()> {
        let port_id = require_port(request)?;
        let provider_id = require_provider(request)?;
        let engine = self
            .ctx
            .engines
            .get(provider_id)
            .ok_or_else(|| HubError::EngineNotFound(provider_id.to_string()))?;

        engine.deliver_snapshot(port_id, &mut |delivery: SnapshotDelivery| {
            send(reply, snapshot_reply(request, port_id, delivery));
            send(
                reply,
                HubResponse::new(
                    ResponseKind::SnapshotComplete,
                    provider_id,
                    &complete_request_id(&request.request_id),
                ),
            );
        });
        Ok(())
    }

    async fn unsubscribe(&self, request: &HubRequest, reply: &PortSender) -> HubResult<()> {
        let port_id = require_port(request)?;
        let provider_id = require_provider(request)?;

        let remaining = self.ctx.router.remove_subscriber(provider_id, port_id);
        self.leave_engine(provider_id, port_id, remaining).await;
        log::info!("Port '{}' unsubscribed from provider '{}'", port_id, provider_id);

        send(reply, HubResponse::reply(ResponseKind::Unsubscribed, request));
        Ok(())
    }

    fn get_status(&self, request: &HubRequest, reply: &PortSender) -> HubResult<()> {
        let provider_id = require_provider(request)?;
        let engine = self
            .ctx
            .engines
            .get(provider_id)
            .ok_or_else(|| HubError::EngineNotFound(provider_id.to_string()))?;
        send(
            reply,
            HubResponse::reply(ResponseKind::Status, request).with_statistics(engine.statistics().to_value()),
        );
        Ok(())
    }

    /// Tells the engine `port_id` left and stops it when `remaining` is zero.
    async fn leave_engine(&self, provider_id: &str, port_id: &str, remaining: usize) {
        if let Some(engine) = self.ctx.engines.get(provider_id) {
            engine.unregister_subscriber(port_id);
        }
        if remaining == 0 && self.ctx.engines.stop_if_unreferenced(provider_id).await {
            log::info!("Provider '{}' has no subscribers left; engine stopped", provider_id);
        }
    }

    /// Removes an unregistered `port_id` from every subscription and settles
    /// the engines it leaves behind. A port that registered again since it
    /// was dropped keeps its subscriptions.
    async fn detach_port(&self, port_id: &str) {
        let departures = self
            .ctx
            .ports
            .unless_registered(port_id, || self.ctx.router.remove_port_from_all(port_id));
        let Some(departures) = departures else {
            log::info!("Port '{}' came back before it was detached; keeping its subscriptions", port_id);
            return;
        };
        for departure in departures {
            self.leave_engine(&departure.provider_id, port_id, departure.remaining).await;
        }
    }

    /// Connection-level close: same cleanup as a reap, without waiting.
    pub async fn disconnect_port(&self, port_id: &str) {
        self.ctx.ports.remove(port_id);
        self.detach_port(port_id).await;
        log::info!("Port '{}' closed", port_id);
    }

    /// Reaps every port silent for longer than the heartbeat timeout.
    /// Returns the reaped port ids.
    pub async fn sweep_dead_ports(&self) -> Vec<String> {
        let dead = self
            .ctx
            .ports
            .reap_stale(Instant::now(), self.ctx.settings.heartbeat_timeout);
        for port_id in &dead {
            self.detach_port(port_id).await;
        }
        if !dead.is_empty() {
            log::info!(
                "Heartbeat sweep reaped {} port(s): {}; {} engine(s) remain",
                dead.len(),
                dead.join(", "),
                self.ctx.engines.engine_count()
            );
        }
        dead
    }

    /// Stops every engine. Used when the hub process shuts down.
    pub async fn shutdown(&self) {
        self.ctx.engines.shutdown().await;
    }
}

/// # Port Connection
///
/// One client connection. Stamps each request with the connection's port id
/// (assigning one on the first message when the client sent none) before
/// dispatching it. Rejected frames still count as the port's heartbeat.
pub struct PortConnection {
    dispatcher: Dispatcher,
    sender: PortSender,
    port_id: Option<String>,
}

impl PortConnection {
    pub fn port_id(&self) -> Option<&str> {
        self.port_id.as_deref()
    }

    /// Handles one raw text frame.
    pub async fn handle_text(&mut self, text: &str) {
        match HubRequest::from_json(text) {
            Ok(request) => self.handle_request(request).await,
            Err(err) => {
                if let Some(port_id) = self.port_id.clone() {
                    self.dispatcher.ctx.ports.touch(&port_id, &self.sender);
                }
                log::warn!("Rejected malformed frame: {}", err);
                let mut response = HubResponse::new(ResponseKind::Error, "", "");
                response.error = Some(err.to_string());
                send(&self.sender, response);
            }
        }
    }

    pub async fn handle_request(&mut self, mut request: HubRequest) {
        let port_id = match (self.port_id.clone(), request.port_id.clone()) {
            (Some(bound), Some(requested)) if !requested.is_empty() && bound != requested => {
                self.dispatcher.ctx.ports.touch(&bound, &self.sender);
                let err = HubError::PortMismatch { bound, requested };
                log::warn!("{}", err);
                send(&self.sender, HubResponse::error(&request, &err));
                return;
            }
            (Some(bound), _) => bound,
            (None, Some(requested)) if !requested.is_empty() => requested,
            (None, _) => PortRegistry::assign_port_id(),
        };

        if self.port_id.is_none() {
            self.port_id = Some(port_id.clone());
        }

        request.port_id = Some(port_id);
        self.dispatcher.dispatch(request, &self.sender).await;
    }

    /// Connection closed by the client or the transport.
    pub async fn close(self) {
        if let Some(port_id) = self.port_id {
            self.dispatcher.disconnect_port(&port_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ports::PortReceiver;
    use crate::engines::{
        DistributionEngine, EngineFactory, EngineMode, EngineSink, EngineStatistics, FeedConfig, StreamEngine,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// A `StreamEngine` with test hooks taken from its config:
    /// `stopDelayMs` slows teardown, `updateAfterDelivery` publishes that row
    /// the moment a snapshot delivery returns.
    struct HookedEngine {
        inner: Arc<StreamEngine>,
        stop_delay: Duration,
        update_after_delivery: Option<Value>,
    }

    #[async_trait]
    impl DistributionEngine for HookedEngine {
        fn provider_id(&self) -> &str {
            self.inner.provider_id()
        }
        fn statistics(&self) -> EngineStatistics {
            self.inner.statistics()
        }
        fn snapshot_cache(&self) -> Vec<Value> {
            self.inner.snapshot_cache()
        }
        fn cache_size(&self) -> usize {
            self.inner.cache_size()
        }
        fn key_column(&self) -> &str {
            self.inner.key_column()
        }
        fn register_subscriber(&self, port_id: &str) {
            self.inner.register_subscriber(port_id)
        }
        fn unregister_subscriber(&self, port_id: &str) {
            self.inner.unregister_subscriber(port_id)
        }
        fn should_subscriber_receive_cached_snapshot(&self, port_id: &str) -> bool {
            self.inner.should_subscriber_receive_cached_snapshot(port_id)
        }
        fn deliver_snapshot(&self, port_id: &str, deliver: &mut dyn FnMut(SnapshotDelivery)) {
            self.inner.deliver_snapshot(port_id, deliver);
            if let Some(row) = &self.update_after_delivery {
                self.inner.push_updates(vec![row.clone()]);
            }
        }
        async fn stop(&self) -> Result<(), EngineError> {
            if !self.stop_delay.is_zero() {
                tokio::time::sleep(self.stop_delay).await;
            }
            self.inner.stop().await
        }
    }

    /// Builds hooked `StreamEngine`s and keeps them so tests can play the
    /// upstream. `fail` fails the build, `createDelayMs` slows it.
    #[derive(Default)]
    struct TestFactory {
        created: AtomicUsize,
        engines: Mutex<Vec<Arc<StreamEngine>>>,
    }

    impl TestFactory {
        fn engine(&self, index: usize) -> Arc<StreamEngine> {
            Arc::clone(&self.engines.lock().unwrap()[index])
        }
    }

    fn config_millis(config: &Value, field: &str) -> Duration {
        Duration::from_millis(config.get(field).and_then(Value::as_u64).unwrap_or(0))
    }

    #[async_trait]
    impl EngineFactory for TestFactory {
        async fn create(
            &self,
            provider_id: &str,
            config: &Value,
            sink: EngineSink,
        ) -> Result<Arc<dyn DistributionEngine>, EngineError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let create_delay = config_millis(config, "createDelayMs");
            if !create_delay.is_zero() {
                tokio::time::sleep(create_delay).await;
            }
            if config.get("fail").and_then(Value::as_bool).unwrap_or(false) {
                return Err(EngineError::Upstream("upstream unreachable".into()));
            }
            let feed = FeedConfig::from_value(config)?;
            let engine = StreamEngine::new(provider_id, &feed, sink);
            self.engines.lock().unwrap().push(Arc::clone(&engine));
            Ok(Arc::new(HookedEngine {
                inner: engine,
                stop_delay: config_millis(config, "stopDelayMs"),
                update_after_delivery: config.get("updateAfterDelivery").cloned(),
            }))
        }
    }

    fn hub() -> (Dispatcher, Arc<TestFactory>) {
        let factory = Arc::new(TestFactory::default());
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

    /// Dispatches `request` and returns everything queued on the port since
    /// the last drain.
    async fn ask(
        dispatcher: &Dispatcher,
        request: HubRequest,
        tx: &PortSender,
        rx: &mut PortReceiver,
    ) -> Vec<Arc<HubResponse>> {
        dispatcher.dispatch(request, tx).await;
        drain(rx)
    }

    fn subscribe(provider: &str, request_id: &str) -> HubRequest {
        HubRequest::new(RequestKind::Subscribe, provider, request_id).with_config(json!({"keyColumn": "id"}))
    }

    fn get_snapshot(provider: &str, request_id: &str, port: &str) -> HubRequest {
        HubRequest::new(RequestKind::GetSnapshot, provider, request_id).with_port(port)
    }

    #[tokio::test]
    async fn subscribe_requires_port_and_config() {
        let (dispatcher, factory) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let no_port = ask(&dispatcher, subscribe("pos-1", "r1"), &tx, &mut rx).await;
        assert_eq!(no_port[0].r#type, ResponseKind::Error);
        assert!(no_port[0].error.as_deref().unwrap().contains("portId"));

        let no_config = HubRequest::new(RequestKind::Subscribe, "pos-1", "r2").with_port("p1");
        let replies = ask(&dispatcher, no_config, &tx, &mut rx).await;
        assert_eq!(replies[0].r#type, ResponseKind::Error);
        assert_eq!(replies[0].request_id, "r2");
        assert!(replies[0].error.as_deref().unwrap().contains("config"));

        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn provider_requests_require_a_provider_id() {
        let (dispatcher, factory) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let kinds = [
            RequestKind::Subscribe,
            RequestKind::Unsubscribe,
            RequestKind::GetSnapshot,
            RequestKind::GetStatus,
        ];

        for (i, kind) in kinds.into_iter().enumerate() {
            let request = HubRequest::new(kind, "", &format!("r{}", i))
                .with_port("A")
                .with_config(json!({"keyColumn": "id"}));
            let replies = ask(&dispatcher, request, &tx, &mut rx).await;
            assert_eq!(replies.len(), 1);
            assert_eq!(replies[0].r#type, ResponseKind::Error);
            assert_eq!(
                replies[0].error.as_deref(),
                Some(HubError::MissingField("providerId").to_string().as_str())
            );
        }

        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.context().engines.active_providers(), Vec::<String>::new());
        assert_eq!(dispatcher.context().router.providers_for_port("A"), Vec::<String>::new());
    }

    #[tokio::test]
    async fn unknown_type_is_named_in_the_error() {
        let (dispatcher, _) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut request = HubRequest::new(RequestKind::Heartbeat, "pos-1", "r1").with_port("p1");
        request.r#type = "purge".to_string();

        let replies = ask(&dispatcher, request, &tx, &mut rx).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].r#type, ResponseKind::Error);
        assert!(replies[0].error.as_deref().unwrap().contains("purge"));
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged_unconditionally() {
        let (dispatcher, _) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let replies = ask(&dispatcher, HubRequest::new(RequestKind::Heartbeat, "", "hb-1"), &tx, &mut rx).await;
        assert_eq!(replies[0].r#type, ResponseKind::HeartbeatAck);
        assert_eq!(replies[0].request_id, "hb-1");
    }

    #[tokio::test]
    async fn full_lifecycle_of_one_port() {
        let (dispatcher, factory) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let replies = ask(&dispatcher, subscribe("pos-1", "r1").with_port("A"), &tx, &mut rx).await;
        assert_eq!(replies[0].r#type, ResponseKind::Subscribed);
        assert_eq!(replies[0].statistics.as_ref().unwrap()["mode"], "idle");

        let engine = factory.engine(0);
        engine.push_snapshot_rows(vec![json!({"id": "1"}), json!({"id": "2"})]);
        engine.complete_snapshot();
        let live = drain(&mut rx);
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].request_id, "live");

        let replies = ask(&dispatcher, get_snapshot("pos-1", "r2", "A"), &tx, &mut rx).await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[1].r#type, ResponseKind::SnapshotComplete);
        assert_eq!(replies[1].request_id, "r2-complete");

        let unsubscribe = HubRequest::new(RequestKind::Unsubscribe, "pos-1", "r3").with_port("A");
        let replies = ask(&dispatcher, unsubscribe, &tx, &mut rx).await;
        assert_eq!(replies[0].r#type, ResponseKind::Unsubscribed);
        assert_eq!(engine.mode(), EngineMode::Stopped);
        assert_eq!(dispatcher.context().engines.engine_count(), 0);

        let status = HubRequest::new(RequestKind::GetStatus, "pos-1", "r4").with_port("B");
        let replies = ask(&dispatcher, status, &tx, &mut rx).await;
        assert_eq!(replies[0].r#type, ResponseKind::Error);
    }

    #[tokio::test]
    async fn only_the_last_unsubscribe_stops_the_engine() {
        let (dispatcher, factory) = hub();
        let (tx, _rx) = mpsc::unbounded_channel();
        dispatcher.dispatch(subscribe("pos-1", "a").with_port("A"), &tx).await;
        dispatcher.dispatch(subscribe("pos-1", "b").with_port("B"), &tx).await;
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        dispatcher
            .dispatch(HubRequest::new(RequestKind::Unsubscribe, "pos-1", "c").with_port("A"), &tx)
            .await;
        assert_eq!(factory.engine(0).mode(), EngineMode::Idle);
        assert_eq!(dispatcher.context().engines.engine_count(), 1);
        assert_eq!(factory.engine(0).statistics().subscriber_count, 1);

        dispatcher
            .dispatch(HubRequest::new(RequestKind::Unsubscribe, "pos-1", "d").with_port("B"), &tx)
            .await;
        assert_eq!(factory.engine(0).mode(), EngineMode::Stopped);
        assert_eq!(dispatcher.context().engines.engine_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_of_a_stranger_still_replies() {
        let (dispatcher, _) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = HubRequest::new(RequestKind::Unsubscribe, "ghost", "u1").with_port("A");
        let replies = ask(&dispatcher, request, &tx, &mut rx).await;
        assert_eq!(replies[0].r#type, ResponseKind::Unsubscribed);
    }

    #[tokio::test]
    async fn live_receiver_gets_an_empty_snapshot() {
        let (dispatcher, factory) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.dispatch(subscribe("pos-1", "r1").with_port("A"), &tx).await;
        factory.engine(0).push_snapshot_rows(vec![json!({"id": "1"}), json!({"id": "2"})]);
        drain(&mut rx);

        let replies = ask(&dispatcher, get_snapshot("pos-1", "r2", "A"), &tx, &mut rx).await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].r#type, ResponseKind::Snapshot);
        assert_eq!(replies[0].data.as_ref().unwrap().len(), 0);
        assert_eq!(replies[1].r#type, ResponseKind::SnapshotComplete);
    }

    #[tokio::test]
    async fn late_joiner_gets_the_cache_and_one_completion() {
        let (dispatcher, factory) = hub();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        dispatcher.dispatch(subscribe("pos-1", "r1").with_port("A"), &tx_a).await;
        let engine = factory.engine(0);
        engine.push_snapshot_rows(vec![json!({"id": "1"}), json!({"id": "2"}), json!({"id": "3"})]);
        engine.complete_snapshot();

        ask(&dispatcher, subscribe("pos-1", "r2").with_port("B"), &tx_b, &mut rx_b).await;
        let replies = ask(&dispatcher, get_snapshot("pos-1", "r3", "B"), &tx_b, &mut rx_b).await;

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].data.as_ref().unwrap().len(), 3);
        let stats = replies[0].statistics.as_ref().unwrap();
        assert_eq!(stats["cacheSize"], 3);
        assert_eq!(stats["keyColumn"], "id");
        assert!(stats.get("warning").is_none());
        let completions = replies
            .iter()
            .filter(|r| r.r#type == ResponseKind::SnapshotComplete)
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn updates_published_right_after_a_replay_follow_its_completion() {
        let (dispatcher, factory) = hub();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let config = json!({"keyColumn": "id", "updateAfterDelivery": {"id": "A", "v": 2}});
        let subscribe_with = |request_id: &str, port: &str| {
            HubRequest::new(RequestKind::Subscribe, "pos-1", request_id)
                .with_port(port)
                .with_config(config.clone())
        };

        dispatcher.dispatch(subscribe_with("r1", "A"), &tx_a).await;
        let engine = factory.engine(0);
        engine.push_snapshot_rows(vec![json!({"id": "A", "v": 1})]);
        engine.complete_snapshot();

        ask(&dispatcher, subscribe_with("r2", "B"), &tx_b, &mut rx_b).await;
        let replies = ask(&dispatcher, get_snapshot("pos-1", "r3", "B"), &tx_b, &mut rx_b).await;

        let kinds: Vec<_> = replies.iter().map(|r| r.r#type).collect();
        assert_eq!(
            kinds,
            vec![ResponseKind::Snapshot, ResponseKind::SnapshotComplete, ResponseKind::Update]
        );
        assert_eq!(replies[0].data.as_ref().unwrap()[0]["v"], 1);
        assert_eq!(replies[2].data.as_ref().unwrap()[0]["v"], 2);
        assert_eq!(replies[2].request_id, "live");
    }

    #[tokio::test]
    async fn updates_racing_a_replay_never_arrive_out_of_order() {
        let (dispatcher, factory) = hub();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        dispatcher.dispatch(subscribe("pos-1", "r1").with_port("A"), &tx_a).await;
        let engine = factory.engine(0);
        engine.push_snapshot_rows(vec![json!({"id": "A", "v": 0})]);
        engine.complete_snapshot();
        ask(&dispatcher, subscribe("pos-1", "r2").with_port("B"), &tx_b, &mut rx_b).await;

        let upstream = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for v in 1..=2000 {
                    engine.push_updates(vec![json!({"id": "A", "v": v})]);
                }
            })
        };
        dispatcher.dispatch(get_snapshot("pos-1", "r3", "B"), &tx_b).await;
        upstream.join().unwrap();

        let frames = drain(&mut rx_b);
        let at = frames.iter().position(|r| r.r#type == ResponseKind::Snapshot).unwrap();
        assert_eq!(frames[at + 1].r#type, ResponseKind::SnapshotComplete);
        let version = |frame: &Arc<HubResponse>| frame.data.as_ref().unwrap()[0]["v"].as_u64().unwrap();
        let replayed = version(&frames[at]);

        assert!(frames[..at].iter().all(|f| version(f) <= replayed));
        assert!(frames[at + 2..].iter().all(|f| version(f) > replayed));
        assert_eq!(frames.len(), 2000 + 2);
    }

    #[tokio::test]
    async fn empty_cache_after_rows_carries_a_warning() {
        let (dispatcher, factory) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.dispatch(subscribe("pos-1", "r1").with_port("A"), &tx).await;
        let engine = factory.engine(0);
        engine.push_snapshot_rows(vec![json!({"tradeId": "1"})]);
        engine.complete_snapshot();

        ask(&dispatcher, subscribe("pos-1", "r2").with_port("B"), &tx, &mut rx).await;
        let replies = ask(&dispatcher, get_snapshot("pos-1", "r3", "B"), &tx, &mut rx).await;
        let stats = replies[0].statistics.as_ref().unwrap();
        assert!(stats["warning"].as_str().unwrap().contains("'id'"));
    }

    #[tokio::test]
    async fn get_snapshot_before_subscribe_is_an_error() {
        let (dispatcher, factory) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let replies = ask(&dispatcher, get_snapshot("pos-1", "r1", "A"), &tx, &mut rx).await;
        assert_eq!(replies.len(), 1);
        assert!(replies[0].error.as_deref().unwrap().contains("Subscribe first"));
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_creation_is_retryable() {
        let (dispatcher, _) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let failing = HubRequest::new(RequestKind::Subscribe, "pos-1", "r1")
            .with_port("A")
            .with_config(json!({"keyColumn": "id", "fail": true}));
        let replies = ask(&dispatcher, failing, &tx, &mut rx).await;
        assert_eq!(replies[0].r#type, ResponseKind::Error);
        assert!(replies[0].error.as_deref().unwrap().contains("upstream unreachable"));
        assert!(!dispatcher.context().router.is_subscribed("pos-1", "A"));

        let replies = ask(&dispatcher, subscribe("pos-1", "r2").with_port("A"), &tx, &mut rx).await;
        assert_eq!(replies[0].r#type, ResponseKind::Subscribed);
    }

    #[tokio::test]
    async fn differing_config_is_flagged() {
        let (dispatcher, _) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ask(&dispatcher, subscribe("pos-1", "r1").with_port("A"), &tx, &mut rx).await;
        let other = HubRequest::new(RequestKind::Subscribe, "pos-1", "r2")
            .with_port("B")
            .with_config(json!({"keyColumn": "other"}));
        let replies = ask(&dispatcher, other, &tx, &mut rx).await;
        assert_eq!(replies[0].r#type, ResponseKind::Subscribed);
        assert_eq!(replies[0].statistics.as_ref().unwrap()["configMismatch"], true);
    }

    #[tokio::test]
    async fn connection_assigns_and_stamps_a_port_id() {
        let (dispatcher, _) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = dispatcher.connect(tx);

        conn.handle_request(subscribe("pos-1", "r1")).await;
        let port_id = conn.port_id().unwrap().to_string();
        assert!(port_id.starts_with("port-"));
        assert!(dispatcher.context().router.is_subscribed("pos-1", &port_id));
        assert_eq!(dispatcher.context().ports.port_count(), 1);

        // A later message without a portId is stamped with the same id.
        conn.handle_request(HubRequest::new(RequestKind::GetSnapshot, "pos-1", "r2")).await;
        let replies = drain(&mut rx);
        assert_eq!(replies.last().unwrap().r#type, ResponseKind::SnapshotComplete);

        conn.handle_request(HubRequest::new(RequestKind::Heartbeat, "", "r3").with_port("intruder"))
            .await;
        let replies = drain(&mut rx);
        assert!(replies[0].error.as_deref().unwrap().contains("intruder"));
        assert!(dispatcher.context().ports.health("intruder").is_none());
    }

    #[tokio::test]
    async fn connection_adopts_a_client_port_id() {
        let (dispatcher, _) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = dispatcher.connect(tx);
        conn.handle_request(HubRequest::new(RequestKind::Heartbeat, "", "hb").with_port("tab-7"))
            .await;
        assert_eq!(conn.port_id(), Some("tab-7"));
        assert_eq!(drain(&mut rx)[0].r#type, ResponseKind::HeartbeatAck);
    }

    #[tokio::test]
    async fn malformed_frames_get_an_error() {
        let (dispatcher, _) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = dispatcher.connect(tx);
        conn.handle_text("{\"type\": ").await;
        let replies = drain(&mut rx);
        assert_eq!(replies[0].r#type, ResponseKind::Error);
    }

    #[tokio::test]
    async fn close_releases_everything_immediately() {
        let (dispatcher, factory) = hub();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = dispatcher.connect(tx);
        conn.handle_request(subscribe("pos-1", "r1").with_port("A")).await;
        conn.handle_request(subscribe("pos-2", "r2")).await;
        assert_eq!(dispatcher.context().engines.engine_count(), 2);

        conn.close().await;
        assert_eq!(dispatcher.context().ports.port_count(), 0);
        assert_eq!(dispatcher.context().engines.engine_count(), 0);
        assert_eq!(factory.engine(0).mode(), EngineMode::Stopped);
        assert_eq!(factory.engine(1).mode(), EngineMode::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_ports_are_reaped_with_their_engines() {
        let (dispatcher, factory) = hub();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let mut quiet = dispatcher.connect(tx_a);
        let mut chatty = dispatcher.connect(tx_b);
        quiet.handle_request(subscribe("solo", "r1").with_port("quiet")).await;
        quiet.handle_request(subscribe("shared", "r2")).await;
        chatty.handle_request(subscribe("shared", "r3").with_port("chatty")).await;

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(25)).await;
            chatty
                .handle_request(HubRequest::new(RequestKind::Heartbeat, "", "hb"))
                .await;
        }

        let reaped = dispatcher.sweep_dead_ports().await;
        assert_eq!(reaped, vec!["quiet".to_string()]);

        let ctx = dispatcher.context();
        assert_eq!(ctx.router.providers_for_port("quiet"), Vec::<String>::new());
        assert_eq!(ctx.engines.active_providers(), vec!["shared".to_string()]);
        assert_eq!(factory.engine(0).mode(), EngineMode::Stopped);
        assert_eq!(ctx.router.subscriber_count("shared"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn any_traffic_keeps_a_port_alive() {
        let (dispatcher, _) = hub();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut conn = dispatcher.connect(tx);
        conn.handle_request(subscribe("pos-1", "r1").with_port("A")).await;

        for i in 0..12 {
            tokio::time::advance(Duration::from_secs(30)).await;
            conn.handle_request(HubRequest::new(RequestKind::GetStatus, "pos-1", &format!("s{}", i)))
                .await;
            assert!(dispatcher.sweep_dead_ports().await.is_empty());
        }
        assert!(dispatcher.context().ports.health("A").unwrap().is_alive);
        assert_eq!(dispatcher.context().engines.engine_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_port_reaped_during_slow_creation_is_not_attached() {
        let (dispatcher, factory) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slow = HubRequest::new(RequestKind::Subscribe, "pos-1", "r1")
            .with_port("A")
            .with_config(json!({"keyColumn": "id", "createDelayMs": 100_000}));

        let subscribing = {
            let dispatcher = dispatcher.clone();
            let tx = tx.clone();
            tokio::spawn(async move { dispatcher.dispatch(slow, &tx).await })
        };
        while dispatcher.context().engines.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        // The port goes silent past the timeout while the engine is still building.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(dispatcher.sweep_dead_ports().await, vec!["A".to_string()]);

        subscribing.await.unwrap();
        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].r#type, ResponseKind::Error);
        assert_eq!(
            replies[0].error.as_deref(),
            Some(HubError::PortExpired("A".into()).to_string().as_str())
        );

        let ctx = dispatcher.context();
        assert!(!ctx.router.is_subscribed("pos-1", "A"));
        assert_eq!(ctx.router.subscriber_count("pos-1"), 0);
        assert_eq!(ctx.engines.engine_count(), 0);
        assert_eq!(ctx.ports.port_count(), 0);
        assert_eq!(factory.engine(0).mode(), EngineMode::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn a_port_back_before_its_detach_keeps_its_subscriptions() {
        let (dispatcher, factory) = hub();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let slow_stop = HubRequest::new(RequestKind::Subscribe, "slow", "r1")
            .with_port("a-port")
            .with_config(json!({"keyColumn": "id", "stopDelayMs": 5_000}));
        dispatcher.dispatch(slow_stop, &tx_a).await;
        dispatcher.dispatch(subscribe("other", "r2").with_port("b-port"), &tx_b).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let sweep = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.sweep_dead_ports().await })
        };
        while dispatcher.context().ports.port_count() != 0 {
            tokio::task::yield_now().await;
        }

        // Reaped but not yet detached: the sweep is still tearing down "slow".
        drain(&mut rx_b);
        let replies = ask(&dispatcher, subscribe("other", "r3").with_port("b-port"), &tx_b, &mut rx_b).await;
        assert_eq!(replies[0].r#type, ResponseKind::Subscribed);

        let reaped = sweep.await.unwrap();
        assert_eq!(reaped, vec!["a-port".to_string(), "b-port".to_string()]);

        let ctx = dispatcher.context();
        assert!(ctx.router.is_subscribed("other", "b-port"));
        assert!(ctx.ports.health("b-port").is_some());
        assert_eq!(ctx.engines.active_providers(), vec!["other".to_string()]);
        assert_eq!(factory.engine(0).mode(), EngineMode::Stopped);
        assert_eq!(factory.engine(1).mode(), EngineMode::Idle);
    }
}
