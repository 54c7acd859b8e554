mod classifier;
mod linear;

use ndarray::{Array2, ArrayView2};
use rand::Rng;

pub use classifier::Classifier;
pub use linear::Linear;

use crate::error::Result;

/// A differentiable model whose parameters live outside of it.
///
/// The parameters are a single flat buffer made of parameter groups laid out back to back in the
/// order given by `param_sizes`. Keeping them outside the model lets the caller own, replicate or
/// shard them as it sees fit.
pub trait Model {
    /// Returns the size of every parameter group, in the model's canonical order.
    fn param_sizes(&self) -> Vec<usize>;

    /// Returns the total amount of parameters in the model.
    fn size(&self) -> usize {
        self.param_sizes().iter().sum()
    }

    /// Generates a fresh set of parameters.
    ///
    /// # Arguments
    /// * `rng` - The source of randomness, seed it to get reproducible parameters.
    ///
    /// # Returns
    /// A flat buffer of `size()` parameters.
    fn init_params<R: Rng>(&self, rng: &mut R) -> Vec<f32>;

    /// Runs the forward pass, caching what the backward pass needs.
    ///
    /// # Arguments
    /// * `params` - The full parameter buffer.
    /// * `x` - A batch of inputs, one sample per row.
    ///
    /// # Returns
    /// The batch of predictions or an error if the shapes don't line up.
    fn forward(&mut self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>>;

    /// Runs the backward pass for the last forward call, accumulating into `grad`.
    ///
    /// # Arguments
    /// * `params` - The same parameter buffer given to `forward`.
    /// * `d` - The derivative of the loss with respect to the predictions.
    /// * `grad` - The gradient buffer, same layout as `params`.
    ///
    /// # Errors
    /// A size mismatch if `d` doesn't match the cached batch or the buffers are not `size()` long.
    fn backward(&mut self, params: &[f32], d: ArrayView2<f32>, grad: &mut [f32]) -> Result<()>;
}
