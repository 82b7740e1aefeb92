//! CLI entry point.
//!
//! Grounded on `proctor/scripts.py`'s `main`/`run_proxy` for work-dir
//! resolution/teardown and the wait-for-first-ready-or-exhaustion loop,
//! and on the `pocketclaw-rs` supervisor binary for the
//! `tracing-subscriber` initialization shape.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::time::sleep;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use circuit_swarm::config::{Cli, CircuitConfig, SwarmConfig};
use circuit_swarm::metrics;
use circuit_swarm::swarm::Swarm;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(cli.loglevel.as_tracing_level().into())
                .from_env_lossy(),
        )
        .init();

    metrics::init_metrics();

    let (work_dir, owns_work_dir) = match &cli.work_dir {
        Some(dir) => (dir.clone(), None),
        None => match tempfile::tempdir() {
            Ok(dir) => {
                let path = dir.path().to_path_buf();
                (path, Some(dir))
            }
            Err(e) => {
                error!("failed to create a temporary working directory: {e}");
                return ExitCode::FAILURE;
            }
        },
    };

    let exit = run(cli, work_dir.clone()).await;

    // `owns_work_dir`'s `TempDir` guard removes the directory on drop,
    // mirroring the original's `rmtree` in a `finally` block.
    drop(owns_work_dir);

    exit
}

async fn run(cli: Cli, work_dir: PathBuf) -> ExitCode {
    let circuit_config = CircuitConfig::from(&cli);
    let swarm_config = SwarmConfig::new(cli.base_socks_port, cli.base_control_port, work_dir)
        .with_circuit_config(circuit_config);

    let swarm = Swarm::start(swarm_config, cli.instances).await;

    info!("waiting for at least one connected circuit...");
    loop {
        if swarm.has_ready_circuit() {
            break;
        }
        if swarm.is_exhausted() {
            error!(fatal = true, "no alive circuit left, bailing out");
            return ExitCode::FAILURE;
        }
        sleep(READY_POLL_INTERVAL).await;
    }

    info!(port = cli.port, "proxy ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    } else {
        info!("interrupted, stopping swarm");
    }

    swarm.stop().await;
    ExitCode::FAILURE
}
