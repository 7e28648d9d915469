//! Runs one rig until the operator, a timer or the rig itself stops it.

pub mod shutdown;

use std::time::Duration;

use anyhow::Context;
use nodes::{NodeRegistry, NodeReport, Rig, RigConfig};
use tracing::{info, warn};

pub use shutdown::StopReason;

/// How a daemon run may be stopped besides Ctrl-C.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after this long.
    pub duration: Option<Duration>,
    /// Stop when `q` is typed on stdin.
    pub watch_stdin: bool,
}

/// Launches the rig and blocks until it is stopped and every node has
/// cleaned up.
pub async fn run(
    config: &RigConfig,
    registry: &NodeRegistry,
    options: RunOptions,
) -> anyhow::Result<(StopReason, Vec<NodeReport>)> {
    let rig = Rig::launch(config, registry).context("Failed to launch rig")?;
    if options.watch_stdin {
        info!("Type 'q' and press Enter to stop the rig");
    }
    let quit = options.watch_stdin.then(shutdown::spawn_stdin_watcher);

    let reason = tokio::select! {
        reason = shutdown::external_stop(options.duration, quit) => reason,
        _ = finished(&rig) => StopReason::Finished,
    };
    info!(?reason, "Stopping rig");
    rig.kill();

    let reports = tokio::task::spawn_blocking(move || rig.wait())
        .await
        .context("Rig shutdown task failed")?;
    for report in &reports {
        match &report.error {
            Some(error) => warn!(node = %report.tag, %error, state = %report.state, "Node ended with an error"),
            None => info!(
                node = %report.tag,
                published = report.messages_out,
                received = report.messages_in,
                "Node finished"
            ),
        }
    }
    Ok((reason, reports))
}

async fn finished(rig: &Rig) {
    let mut ticks = tokio::time::interval(Duration::from_millis(100));
    while !rig.is_finished() {
        ticks.tick().await;
    }
}
