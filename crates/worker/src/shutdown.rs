//! Signal handling

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit code used when a second signal interrupts a graceful shutdown
pub const FORCED_EXIT_CODE: i32 = 130;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled on the first signal.
/// A second signal exits the process immediately.
#[cfg(unix)]
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    use tokio::signal::unix::{signal, SignalKind};

    let token = CancellationToken::new();
    let token_clone = token.clone();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        }
        token_clone.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        warn!("Second signal received, exiting immediately");
        std::process::exit(FORCED_EXIT_CODE);
    });

    Ok(token)
}

#[cfg(not(unix))]
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Received Ctrl-C, initiating graceful shutdown");
        token_clone.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second signal received, exiting immediately");
            std::process::exit(FORCED_EXIT_CODE);
        }
    });

    Ok(token)
}
