mod common;

use std::time::Duration;

use distributed::{CommunicationGroup, Replicated, Sharded, Strategy};
use machine_learning::{
    dataset::Dataset,
    loss::{Nll, Reduction},
    model::{Classifier, Model},
    optimization::Adam,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use worker::{Driver, Method, TrainingSummary, data::DataLoader};

use common::run_group;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Points of `U(-1, 1)` labelled by their sign, class 1 for the positive ones.
fn sign_dataset(len: usize, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let x: Vec<f32> = (0..len).map(|_| rng.random_range(-1f32..1.)).collect();
    let y = x.iter().map(|&x| if x > 0. { 1. } else { 0. }).collect();
    Dataset::new(x, y, 1, 1).unwrap()
}

async fn classify(group: &mut CommunicationGroup, method: Method) -> TrainingSummary {
    let (rank, world_size) = (group.rank(), group.world_size());
    let mut dataset = sign_dataset(640, 11);
    let validation = dataset.split_off(512).unwrap();

    let loader = DataLoader::new(dataset, 32, rank, world_size).unwrap();
    let val_loader = DataLoader::new(validation, 32, rank, world_size).unwrap();

    let model = Classifier::new(1, 2);
    let init = model.init_params(&mut StdRng::seed_from_u64(3));
    let optimizer = |len| Adam::with_defaults(len, 0.05);

    let strategy = match method {
        Method::Replicated => {
            Strategy::Replicated(Replicated::new(group, model, init, optimizer).await.unwrap())
        }
        Method::Sharded => Strategy::Sharded(Sharded::new(group, model, init, optimizer).await.unwrap()),
    };

    let driver = Driver::new(strategy, Nll::new(Reduction::Sum), loader, 10, 16)
        .unwrap()
        .with_validation(val_loader)
        .unwrap();

    driver.run(group).await.unwrap()
}

async fn learns_the_sign(method: Method) {
    let summaries = run_group(2, TIMEOUT, move |mut group| async move {
        let summary = classify(&mut group, method).await;
        group.destroy().await.unwrap();
        summary
    })
    .await;

    let first = &summaries[0];
    assert_eq!(first.validation.len(), 10);
    assert!(first.validation.iter().all(|v| v.samples == 128));

    let start = first.reports[0].global_loss / first.reports[0].samples as f32;
    let last = first.validation[9].loss / 128.;
    assert!(last < start, "validation loss per sample {last}, training started at {start}");
    assert!(last < 0.5, "validation loss per sample {last}");

    assert_eq!(summaries[1], *first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replicated_classifier_learns_the_sign() {
    learns_the_sign(Method::Replicated).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sharded_classifier_learns_the_sign() {
    learns_the_sign(Method::Sharded).await;
}
