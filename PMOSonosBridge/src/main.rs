use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use pmosonos::{AppState, router};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::get_config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = get_config();
    let state = AppState::new(config.scan_timeout(), config.soap_timeout());
    let shutdown = Arc::clone(&state.shutdown);
    let app = router(state);

    let addr = format!("{}:{}", config.host(), config.port());
    let listener = TcpListener::bind(&addr).await?;
    info!("PMOSonosBridge listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("PMOSonosBridge stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: Arc<AtomicBool>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl+C received, shutting down"),
        Err(err) => warn!("Failed to listen for shutdown signal: {}", err),
    }
    // Open event streams poll this flag and tear down, stopping playback
    // and unsubscribing before the server finishes draining.
    shutdown.store(true, Ordering::SeqCst);
}
