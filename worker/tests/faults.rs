mod common;

use std::time::{Duration, Instant};

use distributed::{CommunicationGroup, Replicated, Sharded, Strategy};
use machine_learning::{
    dataset::Dataset,
    loss::{Mse, Reduction},
    model::{Linear, Model},
    optimization::Adam,
};
use rand::{SeedableRng, rngs::StdRng};
use worker::{Driver, Method, WorkerErr, data::DataLoader};

use common::run_group;

const TIMEOUT: Duration = Duration::from_secs(20);
const FAULTY_RANK: usize = 2;

/// Builds a driver by hand, giving `FAULTY_RANK` samples with one feature too many so its first
/// forward pass fails.
async fn faulty_run(group: &mut CommunicationGroup, method: Method) -> Result<(), WorkerErr> {
    let rank = group.rank();
    let features = if rank == FAULTY_RANK { 2 } else { 1 };

    let x: Vec<f32> = (0..64 * features).map(|i| i as f32 * 0.01).collect();
    let dataset = Dataset::new(x, vec![1.; 64], features, 1)?;
    let loader = DataLoader::new(dataset, 16, rank, group.world_size())?;

    let model = Linear::new(1, 1);
    let init = model.init_params(&mut StdRng::seed_from_u64(0));
    let optimizer = |len| Adam::with_defaults(len, 0.01);

    let strategy = match method {
        Method::Replicated => Strategy::Replicated(Replicated::new(group, model, init, optimizer).await?),
        Method::Sharded => Strategy::Sharded(Sharded::new(group, model, init, optimizer).await?),
    };

    let driver = Driver::new(strategy, Mse::new(Reduction::Sum), loader, 3, 1)?;
    driver.run(group).await.map(|_| ())
}

async fn every_worker_stops(method: Method) {
    let start = Instant::now();

    let results = run_group(4, TIMEOUT, move |mut group| async move {
        let rank = group.rank();
        let result = faulty_run(&mut group, method).await;
        (rank, result)
    })
    .await;

    assert!(start.elapsed() < TIMEOUT, "workers waited for the timeout");

    for (rank, result) in results {
        let err = result.expect_err("every worker must fail");

        if rank == FAULTY_RANK {
            assert_eq!(err.kind(), "ModelError");
        } else {
            assert_eq!(err.kind(), "PeerAborted", "rank {rank}: {err}");
            assert!(err.to_string().contains("ModelError"), "rank {rank}: {err}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replicated_failure_mid_step_stops_the_group() {
    every_worker_stops(Method::Replicated).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sharded_failure_mid_step_stops_the_group() {
    every_worker_stops(Method::Sharded).await;
}
