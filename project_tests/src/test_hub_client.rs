//! # Hub Client Smoke Runner
//!
//! Connects to a running `server_hub`, subscribes one or more ports to a mock
//! provider, asks for the snapshot and then reports live throughput until
//! Ctrl+C. Each port keeps itself alive with heartbeats.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Websocket URL of the hub
    #[clap(long, default_value = "ws://127.0.0.1:9010/ws")]
    url: String,

    /// Provider every client subscribes to
    #[clap(long, default_value = "positions")]
    provider: String,

    /// Number of concurrent client connections
    #[clap(short, long, default_value_t = 3)]
    clients: usize,

    /// Rows in the mock initial load
    #[clap(long, default_value_t = 500)]
    snapshot_rows: u64,

    /// Seconds between heartbeats
    #[clap(long, default_value_t = 20)]
    heartbeat_seconds: u64,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 10)]
    report_interval_seconds: u64,
}

#[derive(Default)]
struct Counters {
    snapshot_rows: AtomicU64,
    update_rows: AtomicU64,
    completions: AtomicU64,
    errors: AtomicU64,
}

fn data_len(frame: &Value) -> u64 {
    frame["data"].as_array().map_or(0, |rows| rows.len() as u64)
}

async fn run_client(index: usize, args: Arc<Args>, counters: Arc<Counters>) -> Result<()> {
    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("client {} failed to connect to {}", index, args.url))?;
    let (mut write, mut read) = ws_stream.split();

    let subscribe = json!({
        "type": "subscribe",
        "providerId": args.provider,
        "requestId": format!("sub-{}", index),
        "config": {
            "adapter": "mock",
            "keyColumn": "id",
            "snapshotRows": args.snapshot_rows,
            "updateIntervalMs": 500,
        },
    });
    write.send(Message::Text(subscribe.to_string().into())).await?;

    let mut heartbeat = tokio::time::interval(Duration::from_secs(args.heartbeat_seconds.max(1)));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let frame = json!({"type": "heartbeat", "providerId": "", "requestId": format!("hb-{}", index)});
                write.send(Message::Text(frame.to_string().into())).await?;
            }
            msg = read.next() => {
                let Some(msg) = msg else { break };
                let Message::Text(text) = msg? else { continue };
                let frame: Value = serde_json::from_str(text.as_str())?;
                match frame["type"].as_str().unwrap_or_default() {
                    "subscribed" => {
                        println!("[client {}] subscribed: {}", index, frame["statistics"]);
                        let request = json!({
                            "type": "getSnapshot",
                            "providerId": args.provider,
                            "requestId": format!("snap-{}", index),
                        });
                        write.send(Message::Text(request.to_string().into())).await?;
                    }
                    "snapshot" => {
                        counters.snapshot_rows.fetch_add(data_len(&frame), Ordering::Relaxed);
                    }
                    "snapshot-complete" => {
                        counters.completions.fetch_add(1, Ordering::Relaxed);
                        println!("[client {}] snapshot complete ({})", index, frame["requestId"]);
                    }
                    "update" => {
                        counters.update_rows.fetch_add(data_len(&frame), Ordering::Relaxed);
                    }
                    "error" => {
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                        eprintln!("[client {}] error: {}", index, frame["error"]);
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Arc::new(Args::parse());
    let counters = Arc::new(Counters::default());

    println!("Connecting {} client(s) to {}...", args.clients, args.url);
    for index in 0..args.clients {
        let args = Arc::clone(&args);
        let counters = Arc::clone(&counters);
        tokio::spawn(async move {
            if let Err(e) = run_client(index, args, counters).await {
                eprintln!("[client {}] stopped: {:#}", index, e);
            }
        });
    }

    let mut report = tokio::time::interval(Duration::from_secs(args.report_interval_seconds.max(1)));
    report.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                println!("\n----- {} -----", Utc::now().format("%H:%M:%S"));
                println!("Snapshot rows:  {}", counters.snapshot_rows.load(Ordering::Relaxed));
                println!("Completions:    {}", counters.completions.load(Ordering::Relaxed));
                println!("Update rows:    {}", counters.update_rows.load(Ordering::Relaxed));
                println!("Errors:         {}", counters.errors.load(Ordering::Relaxed));
                println!("----------------------\n");
            }
        }
    }

    Ok(())
}
