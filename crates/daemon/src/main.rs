use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Arg, Command};
use nodes::{NodeRegistry, RigConfig};
use rig_daemon::RunOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rig_daemon=info,nodes=info,bus=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let matches = Command::new("rig_daemon")
        .about("Multi-sensor acquisition rig")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_parser(clap::value_parser!(PathBuf))
                .default_value("rigs/default.yaml")
                .help("Rig configuration file"),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .short('d')
                .value_parser(clap::value_parser!(f64))
                .help("Stop after this many seconds"),
        )
        .arg(
            Arg::new("no-stdin")
                .long("no-stdin")
                .action(clap::ArgAction::SetTrue)
                .help("Do not stop on 'q' typed on stdin"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("rigs/default.yaml"));
    let config = RigConfig::load(&config_path)
        .with_context(|| format!("Failed to load rig from {}", config_path.display()))?;
    let duration = matches
        .get_one::<f64>("duration")
        .map(|s| Duration::try_from_secs_f64(*s))
        .transpose()
        .context("Invalid duration")?;

    tracing::info!(config = %config_path.display(), nodes = config.nodes.len(), "Rig daemon starting...");

    let registry = NodeRegistry::with_builtins();
    let options = RunOptions {
        duration,
        watch_stdin: !matches.get_flag("no-stdin"),
    };
    let (reason, reports) = rig_daemon::run(&config, &registry, options).await?;

    let failed = reports.iter().filter(|r| r.error.is_some()).count();
    tracing::info!(?reason, nodes = reports.len(), failed, "Rig daemon stopped");
    Ok(())
}
