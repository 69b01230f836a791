use anyhow::Result;
use std::sync::Arc;
use tokio::signal;

mod hub_logic;
use hub_logic::{config, downstream, logger};

use lib_hub::core::spawn_heartbeat_sweep;
use lib_hub::engines::AdapterCatalog;
use lib_hub::{Dispatcher, HubContext};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let (config, notes) = config::load_config();
    logger::setup_logging(&config.log_dir(), &config.log_level())?;
    for note in notes {
        log::info!("{}", note);
    }

    let settings = config.hub_settings();
    let catalog = AdapterCatalog::with_builtin_adapters();
    log::info!(
        "Starting hub on port {} with adapters [{}]",
        config.port(),
        catalog.adapter_names().join(", ")
    );
    let dispatcher = Dispatcher::new(HubContext::new(Arc::new(catalog), settings));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let sweep_handle = spawn_heartbeat_sweep(dispatcher.clone(), shutdown_tx.subscribe());
    let mut downstream_handle = tokio::spawn(downstream::run(config.clone(), dispatcher.clone(), shutdown_tx.clone()));

    // Wait for a shutdown signal, or for the listener to give up on its own.
    let downstream_result = tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
            None
        }
        _ = terminate_signal() => {
            log::info!("SIGTERM received, initiating shutdown.");
            None
        }
        result = &mut downstream_handle => Some(result),
    };

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    let downstream_result = match downstream_result {
        Some(result) => result,
        None => downstream_handle.await,
    };
    match downstream_result {
        Ok(Err(e)) => log::error!("Downstream server failed: {}", e),
        Err(e) => log::error!("Downstream task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    let _ = sweep_handle.await;

    dispatcher.shutdown().await;
    log::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            log::warn!("Could not install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    // On non-unix platforms, just wait forever.
    std::future::pending::<()>().await;
}
