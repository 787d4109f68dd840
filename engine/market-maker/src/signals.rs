//! Signal handling for graceful shutdown

use tracing::{error, info};

/// Resolves on Ctrl+C or, on Unix, SIGTERM
pub async fn shutdown_signal() {
    tokio::select! {
        _ = ctrl_c() => info!("Ctrl+C signal received"),
        _ = sigterm() => info!("SIGTERM signal received"),
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn sigterm() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    let received = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGTERM, received.clone()) {
        error!("Failed to register SIGTERM handler: {}", e);
        std::future::pending::<()>().await;
    }

    while !received.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
