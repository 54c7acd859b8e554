use ndarray::{Array2, ArrayView2};

use super::{LossFn, Reduction, check_rows, scale};
use crate::error::{MlErr, Result};

/// Negative log likelihood over log probabilities.
///
/// `y_pred` holds one row of log probabilities per sample and `y` a single column with the index
/// of the expected class.
#[derive(Debug, Default, Clone, Copy)]
pub struct Nll {
    reduction: Reduction,
}

impl Nll {
    /// Returns a new `Nll`.
    ///
    /// # Arguments
    /// * `reduction` - How the per-sample losses of a batch are reduced.
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    fn targets(y_pred: &ArrayView2<f32>, y: &ArrayView2<f32>) -> Result<Vec<usize>> {
        check_rows(y_pred, y)?;

        if y.ncols() != 1 {
            return Err(MlErr::SizeMismatch {
                a: "target columns",
                b: "class index column",
                got: y.ncols(),
                expected: 1,
            });
        }

        let classes = y_pred.ncols();

        y.column(0)
            .iter()
            .enumerate()
            .map(|(row, &target)| {
                let idx = target as usize;
                if target < 0. || target.fract() != 0. || idx >= classes {
                    return Err(MlErr::InvalidTarget {
                        row,
                        target,
                        classes,
                    });
                }

                Ok(idx)
            })
            .collect()
    }
}

impl LossFn for Nll {
    fn reduction(&self) -> Reduction {
        self.reduction
    }

    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<f32> {
        let targets = Self::targets(&y_pred, &y)?;

        let sum: f32 = targets
            .iter()
            .enumerate()
            .map(|(row, &class)| -y_pred[(row, class)])
            .sum();

        Ok(sum * scale(self.reduction, targets.len()))
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<Array2<f32>> {
        let targets = Self::targets(&y_pred, &y)?;
        let k = scale(self.reduction, targets.len());

        let mut d = Array2::zeros(y_pred.raw_dim());
        for (row, class) in targets.into_iter().enumerate() {
            d[(row, class)] = -k;
        }

        Ok(d)
    }
}
