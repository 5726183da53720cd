//! # Signal Handling Module / 信号处理模块
//!
//! Turns Ctrl-C (and SIGTERM on unix) into the cancellation of a run's interrupt token.
//!
//! 将 Ctrl-C（以及 unix 上的 SIGTERM）转换为取消运行的中断令牌。

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Spawns a task that cancels `token` on the first termination signal.
///
/// The task ends on its own once `token` is cancelled for another reason.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            received = wait_for_signal() => {
                match received {
                    Ok(name) => debug!(signal = name, "received termination signal"),
                    Err(error) => {
                        warn!(%error, "failed to listen for termination signals");
                        return;
                    }
                }
                token.cancel();
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
}
