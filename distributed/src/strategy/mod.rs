mod replicated;
mod sharded;

use machine_learning::{model::Model, optimization::Optimizer};
use ndarray::{Array2, ArrayView2};

pub use replicated::Replicated;
pub use sharded::Sharded;

use crate::{error::Result, group::CommunicationGroup};

/// How the parameters of a model are kept consistent across the workers of a group.
///
/// Every method that takes the group runs collectives, so every worker must call them in the
/// same order.
#[trait_variant::make(DataParallel: Send)]
pub trait LocalDataParallel {
    /// Materializes the parameters if needed and runs the model's forward pass.
    ///
    /// # Arguments
    /// * `group` - The worker's group handle.
    /// * `x` - This worker's local batch.
    ///
    /// # Returns
    /// The model's predictions for `x`.
    async fn forward(
        &mut self,
        group: &mut CommunicationGroup,
        x: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>>;

    /// Runs a forward pass that no backward pass follows, as when validating.
    ///
    /// Nothing is kept for a backward pass, a sharded strategy releases the gathered parameters
    /// right away.
    ///
    /// # Arguments
    /// * `group` - The worker's group handle.
    /// * `x` - This worker's local batch.
    async fn evaluate(
        &mut self,
        group: &mut CommunicationGroup,
        x: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>>;

    /// Runs the backward pass and synchronizes the gradient across the group.
    ///
    /// Blocks until every worker contributed its gradient, afterwards every worker holds the
    /// average gradient of what it owns.
    ///
    /// # Arguments
    /// * `group` - The worker's group handle.
    /// * `d` - The derivative of the local loss with respect to the predictions.
    async fn backward(&mut self, group: &mut CommunicationGroup, d: ArrayView2<'_, f32>)
    -> Result<()>;

    /// Applies the optimizer to the parameters this worker owns.
    fn step(&mut self) -> Result<()>;

    /// Clears the accumulated gradient.
    fn zero_grad(&mut self);

    /// Returns the full logical parameter set, gathering it if it's distributed.
    async fn full_parameters(&mut self, group: &mut CommunicationGroup) -> Result<Vec<f32>>;
}

/// The strategy picked at launch.
pub enum Strategy<M, O> {
    Replicated(Replicated<M, O>),
    Sharded(Sharded<M, O>),
}

impl<M, O> DataParallel for Strategy<M, O>
where
    M: Model + Send,
    O: Optimizer + Send,
{
    async fn forward(
        &mut self,
        group: &mut CommunicationGroup,
        x: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>> {
        match self {
            Strategy::Replicated(s) => DataParallel::forward(s, group, x).await,
            Strategy::Sharded(s) => DataParallel::forward(s, group, x).await,
        }
    }

    async fn evaluate(
        &mut self,
        group: &mut CommunicationGroup,
        x: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>> {
        match self {
            Strategy::Replicated(s) => DataParallel::evaluate(s, group, x).await,
            Strategy::Sharded(s) => DataParallel::evaluate(s, group, x).await,
        }
    }

    async fn backward(
        &mut self,
        group: &mut CommunicationGroup,
        d: ArrayView2<'_, f32>,
    ) -> Result<()> {
        match self {
            Strategy::Replicated(s) => DataParallel::backward(s, group, d).await,
            Strategy::Sharded(s) => DataParallel::backward(s, group, d).await,
        }
    }

    fn step(&mut self) -> Result<()> {
        match self {
            Strategy::Replicated(s) => DataParallel::step(s),
            Strategy::Sharded(s) => DataParallel::step(s),
        }
    }

    fn zero_grad(&mut self) {
        match self {
            Strategy::Replicated(s) => DataParallel::zero_grad(s),
            Strategy::Sharded(s) => DataParallel::zero_grad(s),
        }
    }

    async fn full_parameters(&mut self, group: &mut CommunicationGroup) -> Result<Vec<f32>> {
        match self {
            Strategy::Replicated(s) => DataParallel::full_parameters(s, group).await,
            Strategy::Sharded(s) => DataParallel::full_parameters(s, group).await,
        }
    }
}

/// Checks that the initial parameters fit the model.
fn check_init<M: Model>(model: &M, init: &[f32]) -> Result<()> {
    let expected = model.size();

    if init.len() != expected {
        return Err(machine_learning::MlErr::SizeMismatch {
            a: "initial parameters",
            b: "model",
            got: init.len(),
            expected,
        }
        .into());
    }

    Ok(())
}
