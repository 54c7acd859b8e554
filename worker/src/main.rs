use std::process::ExitCode;

use clap::Parser;
use distributed::{CommunicationGroup, LaunchEnv};
use log::{error, info};
use tokio::signal;

use worker::{RunConfig, WorkerErr};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = RunConfig::parse();
    let mut rank = None;

    match run(config, &mut rank).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let rank = rank.map_or_else(|| "?".to_string(), |r: usize| r.to_string());
            error!("fatal [{}] rank={rank}: {e}", e.kind());
            ExitCode::FAILURE
        }
    }
}

async fn run(config: RunConfig, rank: &mut Option<usize>) -> worker::Result<()> {
    config.validate()?;

    let topology = distributed::resolve(&LaunchEnv::from_process())?;
    let identity = topology.identity;
    *rank = Some(identity.rank);

    info!(
        rank = identity.rank,
        world_size = identity.world_size,
        local_rank = identity.local_rank,
        device = topology.binding.device.ordinal;
        "resolved topology, method {:?}",
        config.method
    );

    let mut group = CommunicationGroup::create_tcp(&topology, config.timeout()).await?;

    let outcome = tokio::select! {
        ret = worker::train(&mut group, &config) => ret,
        _ = signal::ctrl_c() => Err(WorkerErr::Interrupted),
    };

    match outcome {
        Ok(summary) => {
            info!(rank = identity.rank, steps = summary.steps; "final parameters {:?}", summary.parameters);
            group.destroy().await?;
            Ok(())
        }
        Err(WorkerErr::Interrupted) => {
            info!(rank = identity.rank; "received SIGINT");
            group.abort("interrupted").await;
            Err(WorkerErr::Interrupted)
        }
        Err(e) => Err(e),
    }
}
