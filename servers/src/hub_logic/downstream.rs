//! # Downstream Server
//!
//! The websocket front end of the hub. Every websocket connection is one port:
//! each text frame is one request, each response is one text frame, and the
//! socket closing (cleanly or by read error) is the connection-level close
//! signal that releases the port's subscriptions at once.
//!
//! - `GET /ws`: websocket upgrade.
//! - `GET /health`: liveness check.
//! - `GET /status`: ports, engines and providers currently held by the hub.

use crate::hub_logic::config::Config;
use anyhow::Result;
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::{SinkExt, StreamExt};
use lib_hub::Dispatcher;
use lib_hub::core::PortReceiver;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    shutdown: broadcast::Sender<()>,
}

pub async fn run(config: Config, dispatcher: Dispatcher, shutdown: broadcast::Sender<()>) -> Result<()> {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let state = ServerState {
        dispatcher,
        shutdown: shutdown.clone(),
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let mut shutdown_rx = shutdown.subscribe();

    if let Some((cert_path, key_path)) = config.tls_paths() {
        log::info!("Downstream server listening on wss://{}", addr);
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path).await?;

        let handle = axum_server::Handle::new();
        let signal_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_rx.recv().await.ok();
            log::info!("Downstream server shutting down.");
            signal_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        log::info!("Downstream server listening on ws://{} (no TLS material found)", addr);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_rx.recv().await.ok();
                log::info!("Downstream server shutting down.");
            })
            .await?;
    }

    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn status_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(status_body(&state.dispatcher))
}

fn status_body(dispatcher: &Dispatcher) -> Value {
    let ctx = dispatcher.context();
    json!({
        "ports": ctx.ports.port_count(),
        "engines": ctx.engines.engine_count(),
        "pendingEngines": ctx.engines.pending_count(),
        "providers": ctx.engines.active_providers(),
        "heartbeatIntervalSeconds": ctx.settings.heartbeat_interval.as_secs(),
        "heartbeatTimeoutSeconds": ctx.settings.heartbeat_timeout.as_secs(),
    })
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx): (_, PortReceiver) = mpsc::unbounded_channel();
    let mut connection = state.dispatcher.connect(tx);
    let mut shutdown = state.shutdown.subscribe();
    log::debug!("Websocket connection opened");

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => connection.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("Websocket read error on port {:?}: {}", connection.port_id(), e);
                    break;
                }
            },
            Some(response) = rx.recv() => {
                let text = match response.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to encode {:?} response: {}", response.r#type, e);
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    connection.close().await;
    let _ = ws_tx.close().await;
}
