use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quorum_gme::config::Cli;
use quorum_gme::requester::TracingObserver;
use quorum_gme::transport::Transport;
use quorum_gme::{manager, requester};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = cli.to_config();
    cfg.validate().context("invalid simulation configuration")?;

    info!(
        version = quorum_gme::VERSION,
        managers = cfg.managers,
        groups = cfg.groups,
        total_ranks = cfg.total_ranks,
        sim_secs = cfg.sim_duration.as_secs(),
        "starting quorum-gme simulation"
    );

    let (transport, mut receivers) = Transport::build(0..cfg.total_ranks);
    let observer: Arc<dyn requester::CsObserver> = Arc::new(TracingObserver);

    let mut tasks = Vec::new();
    for rank in 0..cfg.total_ranks {
        let rx = receivers.remove(&rank).expect("transport wires every rank");
        let transport = transport.clone();
        let cfg = cfg.clone();
        if cfg.is_manager(rank) {
            tasks.push(tokio::spawn(async move {
                manager::run(rank, cfg, rx, transport).await;
            }));
        } else {
            let observer = observer.clone();
            tasks.push(tokio::spawn(async move {
                requester::run(rank, cfg, rx, transport, observer).await;
            }));
        }
    }

    // Ranks never stop requesting on their own (§5), so the simulation is
    // bounded purely by wall clock: once it elapses, dropping the runtime
    // at the end of `main` aborts every task still in flight.
    tokio::time::sleep(cfg.sim_duration).await;
    for task in &tasks {
        task.abort();
    }
    info!(sim_secs = cfg.sim_duration.as_secs(), "wall-clock bound reached, shutting down");

    Ok(())
}
