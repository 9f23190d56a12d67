//! Process shutdown signalling.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Spawn a task that cancels the returned token on SIGTERM or Ctrl-C.
///
/// The HTTP server and the dispatch consumer both watch this token and
/// drain before the process exits.
#[must_use]
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            () = terminate() => info!("Received SIGTERM, shutting down"),
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => warn!(error = %e, "Ctrl-C handler failed, shutting down"),
            },
        }
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Cannot install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
