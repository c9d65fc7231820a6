use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancels `token` on the first SIGINT or SIGTERM.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            signal = wait_for_signal() => match signal {
                Ok(name) => info!(signal = name, "shutdown requested"),
                Err(err) => warn!(error = %err, "signal handler failed; shutting down"),
            },
            _ = token.cancelled() => return,
        }
        token.cancel();
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}

/// Waits for supervised tasks to finish, up to `grace` in total. Returns how
/// many had to be aborted.
pub async fn drain(handles: Vec<JoinHandle<()>>, grace: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + grace;
    let mut pending = handles.into_iter();
    while let Some(mut handle) = pending.next() {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "subsystem task ended abnormally"),
            Err(_) => {
                handle.abort();
                let mut aborted = 1;
                for rest in pending {
                    if !rest.is_finished() {
                        rest.abort();
                        aborted += 1;
                    }
                }
                warn!(aborted, "shutdown grace period elapsed; aborting subsystems");
                return aborted;
            }
        }
    }
    0
}
