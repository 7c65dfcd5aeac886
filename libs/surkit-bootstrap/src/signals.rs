use tokio::signal;

/// Which termination signal was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// Wait for a termination signal (Ctrl+C, SIGTERM).
///
/// Fails only if no signal handler could be installed at all.
pub async fn wait_for_shutdown() -> std::io::Result<ShutdownSignal> {
    let ctrl_c = async {
        signal::ctrl_c().await.map_err(|e| {
            tracing::error!(%e, "Failed to install Ctrl+C handler");
            e
        })
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut handler) => {
                handler.recv().await;
                Ok(())
            }
            Err(e) => {
                tracing::error!(%e, "Failed to install SIGTERM handler");
                Err(e)
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    let received = tokio::select! {
        result = ctrl_c => result.map(|_| ShutdownSignal::Interrupt)?,
        result = terminate => result.map(|_| ShutdownSignal::Terminate)?,
    };

    tracing::info!(signal = ?received, "Shutdown signal received");
    Ok(received)
}
