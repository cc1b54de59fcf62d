use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use vapi_bridge::config::Config;
use vapi_bridge::vapi::VapiConnector;
use vapi_bridge::Bridge;

fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() {
    setup_tracing();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    let connector = Arc::new(VapiConnector::new(config.vapi_private_api_key.clone()));
    let bridge = match Bridge::bind(config, connector).await {
        Ok(bridge) => bridge,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind udp socket");
            std::process::exit(1);
        }
    };

    let reactor = tokio::spawn(bridge.clone().run());

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");

    reactor.abort();
    bridge.shutdown().await;
    tracing::info!("shutdown complete");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
