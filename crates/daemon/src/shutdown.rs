use std::io::BufRead;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

/// Why the daemon stopped its rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    CtrlC,
    /// The operator typed `q`.
    Quit,
    Elapsed,
    /// Every node ended on its own.
    Finished,
}

/// Watches stdin on a detached thread and reports once a line reading `q`
/// arrives. The channel disconnects without a message if stdin closes.
pub(crate) fn spawn_stdin_watcher() -> flume::Receiver<()> {
    let (tx, rx) = flume::bounded(1);
    let spawned = thread::Builder::new()
        .name("stdin-watch".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) if line.trim().eq_ignore_ascii_case("q") => {
                        let _ = tx.send(());
                        return;
                    }
                    Ok(_) => info!("Type 'q' and press Enter to stop the rig"),
                    Err(_) => break,
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Could not watch stdin");
    }
    rx
}

/// Resolves when the rig should be stopped from outside.
pub(crate) async fn external_stop(duration: Option<Duration>, quit: Option<flume::Receiver<()>>) -> StopReason {
    let elapsed = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    let quit = async {
        match quit {
            Some(rx) => {
                if rx.recv_async().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending().await,
        }
    };

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => StopReason::CtrlC,
        _ = elapsed => StopReason::Elapsed,
        _ = quit => StopReason::Quit,
    }
}
