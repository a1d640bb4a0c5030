use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install SIGTERM/SIGINT handlers.
///
/// The returned token is cancelled on the first signal. Worker loops stop
/// polling once it fires but let a running job finish.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping after the current job");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping after the current job");
            }
        }
        trigger.cancel();
    });

    Ok(token)
}
