use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler for SIGTERM and SIGINT.
///
/// The returned token is cancelled on the first signal. The node command waits
/// on it and then leaves the group cleanly, so peers see a MEMBER_REMOVED right
/// away instead of waiting out the failure threshold.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, leaving group");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, leaving group");
            }
        }
        trigger.cancel();
    });

    Ok(token)
}
