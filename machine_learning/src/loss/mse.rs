use ndarray::{Array2, ArrayView2};

use super::{LossFn, Reduction, check_rows, scale};
use crate::error::{MlErr, Result};

/// Squared error loss function.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mse {
    reduction: Reduction,
}

impl Mse {
    /// Returns a new `Mse`.
    ///
    /// # Arguments
    /// * `reduction` - How the squared errors of a batch are reduced.
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    fn check(y_pred: &ArrayView2<f32>, y: &ArrayView2<f32>) -> Result<()> {
        check_rows(y_pred, y)?;

        if y_pred.ncols() != y.ncols() {
            return Err(MlErr::SizeMismatch {
                a: "prediction columns",
                b: "target columns",
                got: y_pred.ncols(),
                expected: y.ncols(),
            });
        }

        Ok(())
    }
}

impl LossFn for Mse {
    fn reduction(&self) -> Reduction {
        self.reduction
    }

    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<f32> {
        Self::check(&y_pred, &y)?;
        let sum: f32 = (&y_pred - &y).mapv(|e| e.powi(2)).sum();
        Ok(sum * scale(self.reduction, y.nrows()))
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<Array2<f32>> {
        Self::check(&y_pred, &y)?;
        Ok((&y_pred - &y) * (2. * scale(self.reduction, y.nrows())))
    }
}
