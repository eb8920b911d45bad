use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on the first SIGTERM or SIGINT.
///
/// The worker loop treats cancellation as "stop at the next boundary": an
/// idle worker exits right away, a running workflow is killed and reported
/// as aborted. A second signal exits the process immediately.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, stopping worker"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, stopping worker"),
        }
        trigger.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::warn!("Second signal received, exiting without cleanup");
        std::process::exit(130);
    });

    Ok(token)
}
