mod common;

use machine_learning::{
    loss::{LossFn, Mse, Reduction},
    model::{Linear, Model},
    optimization::{Adam, Optimizer},
};
use rand::{SeedableRng, rngs::StdRng};
use worker::{
    Method, RunConfig, TrainingSummary,
    builder::datasets,
    data::DataLoader,
};

use common::{config, run_group};

/// What the single device run observed.
struct Reference {
    /// The loss of every report interval.
    losses: Vec<f32>,
    /// The loss over the whole validation split after every epoch.
    validation: Vec<f32>,
    params: Vec<f32>,
}

/// Trains the same run on a single device over the unpartitioned global batches.
fn reference(config: &RunConfig) -> Reference {
    let (dataset, validation) = datasets(config).unwrap();
    let validation = validation.unwrap();
    let (val_x, val_y) = validation
        .gather(&(0..validation.len()).collect::<Vec<_>>())
        .unwrap();
    let mut loader = DataLoader::new(dataset, config.batch_size, 0, 1).unwrap();

    let mut model = Linear::new(1, 1);
    let mut params = model.init_params(&mut StdRng::seed_from_u64(config.seed));
    let mut grad = vec![0.; params.len()];
    let mut optimizer = Adam::with_defaults(params.len(), config.lr);
    let loss = Mse::new(Reduction::Sum);

    let mut losses = Vec::new();
    let mut val_losses = Vec::new();
    let mut acc = 0.;
    let steps_per_epoch = loader.steps_per_epoch();

    for step in 1..=steps_per_epoch * config.epochs {
        let batch = loader.next_batch().unwrap();
        let y_pred = model.forward(&params, batch.x.view()).unwrap();
        acc += loss.loss(y_pred.view(), batch.y.view()).unwrap();

        let d = loss.loss_prime(y_pred.view(), batch.y.view()).unwrap();
        grad.fill(0.);
        model.backward(&params, d.view(), &mut grad).unwrap();
        optimizer.update_params(&mut params, &grad).unwrap();

        if step % config.print_every == 0 {
            losses.push(acc);
            acc = 0.;
        }

        if step % steps_per_epoch == 0 {
            let y_pred = model.forward(&params, val_x.view()).unwrap();
            val_losses.push(loss.loss(y_pred.view(), val_y.view()).unwrap());
            loader.reset(step / steps_per_epoch);
        }
    }

    Reference {
        losses,
        validation: val_losses,
        params,
    }
}

async fn run_distributed(world_size: usize, config: RunConfig) -> Vec<TrainingSummary> {
    let timeout = config.timeout();

    run_group(world_size, timeout, move |mut group| {
        let config = config.clone();
        async move {
            let summary = worker::train(&mut group, &config).await.unwrap();
            group.destroy().await.unwrap();
            summary
        }
    })
    .await
}

fn assert_close(got: f32, expected: f32, what: &str) {
    let rel = (got - expected).abs() / expected.abs().max(f32::EPSILON);
    assert!(rel <= 1e-5, "{what}: got {got}, expected {expected} (relative error {rel})");
}

async fn matches_single_device(method: Method) {
    let config = config(method);
    let expected = reference(&config);
    let summaries = run_distributed(4, config).await;

    let first = &summaries[0];
    assert_eq!(first.steps, 10);
    assert_eq!(first.parameters.len(), 2);
    assert_eq!(first.reports.len(), expected.losses.len());

    for (report, expected) in first.reports.iter().zip(&expected.losses) {
        assert_eq!(report.samples, 2 * 256);
        assert_close(report.global_loss, *expected, "global loss");
    }

    assert_eq!(first.validation.len(), expected.validation.len());
    for (report, expected) in first.validation.iter().zip(&expected.validation) {
        assert_eq!(report.samples, 512);
        assert_close(report.loss, *expected, "validation loss");
    }

    for (got, expected) in first.parameters.iter().zip(&expected.params) {
        assert_close(*got, *expected, "parameter");
    }

    for summary in &summaries[1..] {
        assert_eq!(summary, first);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replicated_run_matches_single_device() {
    matches_single_device(Method::Replicated).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sharded_run_matches_single_device() {
    matches_single_device(Method::Sharded).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn both_methods_agree() {
    let replicated = run_distributed(4, config(Method::Replicated)).await;
    let sharded = run_distributed(4, config(Method::Sharded)).await;

    assert_eq!(replicated[0].reports, sharded[0].reports);
    assert_eq!(replicated[0].validation, sharded[0].validation);
    assert_eq!(replicated[0].parameters, sharded[0].parameters);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn uneven_batches_cover_every_sample() {
    let config = RunConfig {
        epochs: 2,
        print_every: 3,
        samples: 1000,
        shuffle: true,
        ..config(Method::Sharded)
    };

    let summaries = run_distributed(3, config).await;
    let first = &summaries[0];

    assert_eq!(first.steps, 8);
    assert_eq!(first.epochs, 2);

    let samples: Vec<_> = first.reports.iter().map(|r| r.samples).collect();
    assert_eq!(samples, [768, 744, 488]);
    assert_eq!(first.reports.last().map(|r| (r.epoch, r.step)), Some((1, 8)));

    let validated: Vec<_> = first.validation.iter().map(|v| (v.epoch, v.samples)).collect();
    assert_eq!(validated, [(0, 512), (1, 512)]);

    for summary in &summaries[1..] {
        assert_eq!(summary, first);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn validation_follows_every_epoch_and_can_be_skipped() {
    let config = RunConfig {
        epochs: 3,
        ..config(Method::Sharded)
    };
    let expected = reference(&config);
    let summaries = run_distributed(2, config.clone()).await;

    let epochs: Vec<_> = summaries[0].validation.iter().map(|v| v.epoch).collect();
    assert_eq!(epochs, [0, 1, 2]);
    for (report, expected) in summaries[0].validation.iter().zip(&expected.validation) {
        assert_close(report.loss, *expected, "validation loss");
    }

    let skipped = run_distributed(2, RunConfig { val_samples: 0, ..config }).await;
    assert!(skipped[0].validation.is_empty());
    assert_eq!(skipped[0].reports, summaries[0].reports);
}
