use std::fmt;

use tokio::signal;
use tracing::{info, warn};

/// Process signal that asked for shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
        })
    }
}

/// Waits for SIGINT or (unix only) SIGTERM. A handler that cannot be installed never fires.
pub async fn wait_for_signal() -> ShutdownSignal {
    let interrupt = async {
        match signal::ctrl_c().await {
            Ok(()) => ShutdownSignal::Interrupt,
            Err(error) => {
                warn!(%error, "SIGINT handler unavailable");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                ShutdownSignal::Terminate
            }
            Err(error) => {
                warn!(%error, "SIGTERM handler unavailable");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<ShutdownSignal>();

    tokio::select! {
        received = interrupt => received,
        received = terminate => received,
    }
}

/// [`wait_for_signal`] for use as a graceful-shutdown future.
pub async fn shutdown_signal() {
    let received = wait_for_signal().await;
    info!(signal = %received, "shutdown requested");
}
