#![forbid(unsafe_code)]

use std::io;
use tokio::signal::unix::{SignalKind, signal};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGINT, usually Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn wait_for_signal() -> io::Result<SignalEvent> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let event = tokio::select! {
        _ = interrupt.recv() => SignalEvent::Interrupt,
        _ = terminate.recv() => SignalEvent::Terminate,
    };
    debug!(?event, "received signal");
    Ok(event)
}
