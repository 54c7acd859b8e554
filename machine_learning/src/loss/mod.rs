mod mse;
mod nll;

use ndarray::{Array2, ArrayView2};

pub use mse::Mse;
pub use nll::Nll;

use crate::error::{MlErr, Result};

/// How the per-sample losses of a batch are folded into one number.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Sum over the samples, the result scales with the batch size.
    #[default]
    Sum,
    /// Mean over the samples.
    Mean,
}

pub trait LossFn {
    /// Returns the reduction this loss function applies.
    fn reduction(&self) -> Reduction;

    /// Computes the reduced loss of a batch of predictions.
    ///
    /// # Arguments
    /// * `y_pred` - The model's predictions, one sample per row.
    /// * `y` - The expected values, one sample per row.
    ///
    /// # Returns
    /// The loss or an error if the shapes are incompatible.
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<f32>;

    /// Computes the derivative of `loss` with respect to `y_pred`.
    ///
    /// # Arguments
    /// * `y_pred` - The model's predictions, one sample per row.
    /// * `y` - The expected values, one sample per row.
    ///
    /// # Returns
    /// An array shaped like `y_pred` or an error if the shapes are incompatible.
    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<Array2<f32>>;
}

/// Returns the factor a per-sample quantity is scaled by under `reduction`.
fn scale(reduction: Reduction, rows: usize) -> f32 {
    match reduction {
        Reduction::Sum => 1.,
        Reduction::Mean if rows == 0 => 0.,
        Reduction::Mean => 1. / rows as f32,
    }
}

fn check_rows(y_pred: &ArrayView2<f32>, y: &ArrayView2<f32>) -> Result<()> {
    if y_pred.nrows() != y.nrows() {
        return Err(MlErr::SizeMismatch {
            a: "predictions",
            b: "targets",
            got: y_pred.nrows(),
            expected: y.nrows(),
        });
    }

    Ok(())
}
