use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

/// Install a SIGTERM/SIGINT handler and return the token it cancels.
///
/// Every subsystem loop selects on this token and drains on its own; the
/// handler only flips it.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| EngineError::Internal(format!("installing SIGTERM handler: {e}")))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| EngineError::Internal(format!("installing SIGINT handler: {e}")))?;

    let handler_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
        handler_token.cancel();
    });

    Ok(token)
}
