use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::sleep;
use tracing::info;

use crate::registry::Registry;

/// Resolves once SIGINT or (on Unix) SIGTERM is received.
pub async fn signal_received() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Drain the registry: poll every second for it to empty, with a 5-second
/// hard wall-clock ceiling regardless of outstanding connections.
///
/// Returns `true` on a clean drain, `false` if the wall clock expired first.
/// The caller is expected to exit with an error status in the latter case.
pub async fn drain(registry: Arc<Registry>) -> bool {
    registry.begin_shutdown();
    info!("shutdown signal received, draining connections");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if registry.live_count() == 0 {
            info!("all connections drained");
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            info!(
                remaining = registry.live_count(),
                "shutdown wall clock exceeded, exiting anyway"
            );
            return false;
        }
        sleep(Duration::from_secs(1)).await;
    }
}
