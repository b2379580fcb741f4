/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) or SIGTERM cancels the run: no further queries are
/// started and in-flight ones stop at their next blocking step.
use tokio_util::sync::CancellationToken;

/// Spawn a task that cancels `token` on the first SIGINT or SIGTERM.
pub fn install(token: CancellationToken) -> std::io::Result<()> {
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = sigterm.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = token.cancelled() => return,
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to listen for SIGINT");
                    return;
                }
                tracing::warn!("received SIGINT, cancelling collection");
            }
            _ = terminate => {
                tracing::warn!("received SIGTERM, cancelling collection");
            }
        }
        token.cancel();
    });

    Ok(())
}

