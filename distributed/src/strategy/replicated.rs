use comms::specs::collective::ReduceOp;
use log::debug;
use machine_learning::{model::Model, optimization::Optimizer};
use ndarray::{Array2, ArrayView2};

use super::{DataParallel, check_init};
use crate::{error::Result, group::CommunicationGroup};

/// Full replication: every worker holds every parameter and the gradient is averaged before each
/// optimizer step, so the replicas never drift apart.
pub struct Replicated<M, O> {
    model: M,
    params: Vec<f32>,
    grad: Vec<f32>,
    optimizer: O,
}

impl<M: Model, O: Optimizer> Replicated<M, O> {
    /// Creates a new `Replicated` strategy, making every replica start from rank 0's parameters.
    ///
    /// # Arguments
    /// * `group` - The worker's group handle.
    /// * `model` - The model to train.
    /// * `init` - This worker's initial parameters, only rank 0's survive.
    /// * `optimizer` - Builds the optimizer for the given amount of parameters.
    ///
    /// # Errors
    /// A model error if `init` doesn't fit the model, or any collective failure.
    pub async fn new<F>(
        group: &mut CommunicationGroup,
        model: M,
        mut init: Vec<f32>,
        optimizer: F,
    ) -> Result<Self>
    where
        F: FnOnce(usize) -> O,
    {
        check_init(&model, &init)?;
        group.broadcast(&mut init, 0).await?;

        debug!(rank = group.rank(), params = init.len(); "replicated parameters in sync");

        Ok(Self {
            model,
            grad: vec![0.; init.len()],
            optimizer: optimizer(init.len()),
            params: init,
        })
    }

    /// Returns this worker's replica of the parameters.
    pub fn params(&self) -> &[f32] {
        &self.params
    }
}

impl<M, O> DataParallel for Replicated<M, O>
where
    M: Model + Send,
    O: Optimizer + Send,
{
    async fn forward(
        &mut self,
        _group: &mut CommunicationGroup,
        x: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>> {
        Ok(self.model.forward(&self.params, x)?)
    }

    async fn evaluate(
        &mut self,
        _group: &mut CommunicationGroup,
        x: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>> {
        Ok(self.model.forward(&self.params, x)?)
    }

    /// Accumulates the local gradient, then averages the whole buffer in a single collective.
    ///
    /// Entries the model leaves untouched stay zero and still take part in the average.
    async fn backward(
        &mut self,
        group: &mut CommunicationGroup,
        d: ArrayView2<'_, f32>,
    ) -> Result<()> {
        self.model.backward(&self.params, d, &mut self.grad)?;
        group.all_reduce(&mut self.grad, ReduceOp::Average).await
    }

    fn step(&mut self) -> Result<()> {
        Ok(self.optimizer.update_params(&mut self.params, &self.grad)?)
    }

    fn zero_grad(&mut self) {
        self.grad.fill(0.);
    }

    async fn full_parameters(&mut self, _group: &mut CommunicationGroup) -> Result<Vec<f32>> {
        Ok(self.params.clone())
    }
}
