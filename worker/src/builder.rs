use distributed::{CommunicationGroup, Replicated, Sharded, Strategy};
use machine_learning::{
    dataset::Dataset,
    loss::{Mse, Reduction},
    model::{Linear, Model},
    optimization::Adam,
};
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    config::{Method, RunConfig},
    data::DataLoader,
    driver::{Driver, TrainingSummary},
    error::{Result, WorkerErr},
};

/// The line the synthetic dataset samples: `y = 2x + 1`.
pub const TRUE_WEIGHTS: [f32; 1] = [2.];
pub const TRUE_BIAS: f32 = 1.;

/// The driver of a linear regression run, the one the worker binary trains.
pub type LinearDriver = Driver<Strategy<Linear, Adam>, Mse>;

pub struct DriverBuilder;

impl DriverBuilder {
    /// Builds the driver described by `config` for this worker.
    ///
    /// Every worker generates the same dataset, validation split and initial parameters from the
    /// configured seed, the strategy then makes rank 0's parameters everyone's.
    ///
    /// # Arguments
    /// * `group` - This worker's group handle, the strategy's construction runs collectives.
    /// * `config` - The run configuration, the same on every worker.
    ///
    /// # Errors
    /// `InvalidConfig` for an invalid configuration, or whatever the strategy's construction
    /// fails with.
    pub async fn build(group: &mut CommunicationGroup, config: &RunConfig) -> Result<LinearDriver> {
        config.validate()?;

        let (rank, world_size) = (group.rank(), group.world_size());
        let (dataset, validation) = datasets(config)?;

        let mut loader = DataLoader::new(dataset, config.batch_size, rank, world_size)?;
        if config.shuffle {
            loader = loader.with_shuffle(config.seed);
        }

        let model = Linear::new(TRUE_WEIGHTS.len(), 1);
        let init = model.init_params(&mut StdRng::seed_from_u64(config.seed));

        let lr = config.lr;
        let optimizer = move |len| Adam::with_defaults(len, lr);

        let strategy = match config.method {
            Method::Replicated => {
                Strategy::Replicated(Replicated::new(group, model, init, optimizer).await?)
            }
            Method::Sharded => Strategy::Sharded(Sharded::new(group, model, init, optimizer).await?),
        };

        let driver = Driver::new(
            strategy,
            Mse::new(Reduction::Sum),
            loader,
            config.epochs,
            config.print_every,
        )?;

        match validation {
            Some(dataset) => {
                driver.with_validation(DataLoader::new(dataset, config.batch_size, rank, world_size)?)
            }
            None => Ok(driver),
        }
    }
}

/// Generates the synthetic training set and holds out its last `val_samples` for validation.
///
/// # Returns
/// The training set and the validation split, `None` when `val_samples` is zero.
pub fn datasets(config: &RunConfig) -> Result<(Dataset, Option<Dataset>)> {
    let len = config
        .samples
        .checked_add(config.val_samples)
        .ok_or_else(|| WorkerErr::invalid_config("--samples plus --val-samples overflows"))?;
    let mut dataset = Dataset::synthetic_linear(len, &TRUE_WEIGHTS, TRUE_BIAS, config.seed)?;

    let validation = match config.val_samples {
        0 => None,
        _ => Some(dataset.split_off(config.samples)?),
    };

    Ok((dataset, validation))
}

/// Builds this worker's driver and runs it to completion.
///
/// A worker that fails to build its driver aborts the group the same way a failing driver does.
///
/// # Errors
/// The first fatal error this worker hit, after the rest of the group was told about it.
pub async fn train(group: &mut CommunicationGroup, config: &RunConfig) -> Result<TrainingSummary> {
    let driver = match DriverBuilder::build(group, config).await {
        Ok(driver) => driver,
        Err(e) => {
            group.abort(&format!("[{}] {e}", e.kind())).await;
            return Err(e);
        }
    };

    driver.run(group).await
}
