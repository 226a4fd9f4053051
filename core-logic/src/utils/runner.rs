use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cancels `token` on Ctrl+C or SIGTERM.
pub fn listen_for_shutdown(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            sig = wait_for_signal() => {
                match sig {
                    Ok(name) => {
                        warn!(signal = name, "🛑 Signal caught. Initiating graceful shutdown...");
                        token.cancel();
                    }
                    Err(err) => error!("Unable to listen for shutdown signal: {}", err),
                }
            }
            _ = token.cancelled() => {}
        }
    })
}

/// Once `token` is cancelled, gives the process `grace` to unwind and then
/// terminates it with a non-zero status.
pub fn arm_force_exit(token: CancellationToken, grace: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        token.cancelled().await;
        info!("Shutdown requested, waiting up to {:?} for components", grace);
        tokio::time::sleep(grace).await;
        error!("Forced exit");
        std::process::exit(1);
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = signal::ctrl_c() => res.map(|_| "SIGINT"),
        _ = term.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    signal::ctrl_c().await.map(|_| "CTRL_C")
}
